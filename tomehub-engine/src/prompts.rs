//! Prompt assembly: epistemic evidence blocks, memory zones, and the
//! mode-specific answer templates.

use std::collections::HashSet;

use crate::epistemic::{AnnotatedChunk, AnswerMode, EpistemicLevel, Feature, Quotability};
use crate::network::NetworkStatus;

/// Only the top chunks reach the LLM; more evidence degrades into list mania.
const CONTEXT_CHUNK_LIMIT: usize = 12;
const CONTEXT_TEXT_LIMIT: usize = 500;

/// Build the evidence context with epistemic priority markers and metadata
/// headers. The rendered blocks are presented answerability-first; the
/// returned chunk list is the same selection in the caller's original
/// (post-fusion) order, since sources must mirror that order.
pub fn build_epistemic_context(chunks: &[AnnotatedChunk]) -> (String, Vec<AnnotatedChunk>) {
    // Answerability decides which chunks survive truncation and how they
    // are presented to the LLM. Stable sort keeps input order on ties.
    let mut ranked: Vec<usize> = (0..chunks.len()).collect();
    ranked.sort_by(|&a, &b| {
        chunks[b]
            .annotation
            .answerability_score
            .partial_cmp(&chunks[a].annotation.answerability_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(CONTEXT_CHUNK_LIMIT);

    let mut parts = Vec::new();
    for (i, &idx) in ranked.iter().enumerate() {
        let chunk = &chunks[idx];
        let annotation = &chunk.annotation;
        let exact_match = annotation.features.contains(&Feature::KeywordMatch);

        let meta_header = format!(
            "[ID: {} | Score: {}/7 | Level: {} | Type: {} | Quotability: {} | ExactMatch: {}]",
            i + 1,
            annotation.answerability_score.round() as i64,
            annotation.level.as_str(),
            annotation.passage_type.as_str(),
            annotation.quotability.as_str(),
            exact_match
        );

        let marker = if annotation.quotability == Quotability::High || annotation.level == EpistemicLevel::A {
            "★★★ DOĞRUDAN ALINTI YAP (Quote Verbatim)"
        } else if annotation.level == EpistemicLevel::B {
            "★★ BAĞLAMDA KULLAN (Use in Context)"
        } else {
            "★ SENTEZ YAP (Synthesize Only)"
        };

        let text: String = chunk.hit.text.chars().take(CONTEXT_TEXT_LIMIT).collect();
        let mut block = format!("{meta_header}\n{marker} Kaynak: {}\n", chunk.hit.title);
        if !text.is_empty() {
            block.push_str(&format!("- ALINTI: {text}\n"));
        }
        if let Some(comment) = chunk.hit.comment.as_deref().filter(|c| !c.is_empty()) {
            block.push_str(&format!("- KİŞİSEL NOT: {comment}\n"));
        }
        if let Some(summary) = chunk.hit.summary.as_deref().filter(|s| !s.is_empty()) {
            block.push_str(&format!("- ÖZET: {summary}\n"));
        }
        block.push_str("---\n");
        parts.push(block);
    }

    let selected: HashSet<usize> = ranked.into_iter().collect();
    let used: Vec<AnnotatedChunk> = chunks
        .iter()
        .enumerate()
        .filter(|(idx, _)| selected.contains(idx))
        .map(|(_, chunk)| chunk.clone())
        .collect();

    (parts.join("\n"), used)
}

/// Three labelled memory zones concatenated into one context string.
pub fn build_memory_zones(session_summary: &str, history_str: &str, evidence: &str) -> String {
    let mut zones = Vec::new();
    if !session_summary.trim().is_empty() {
        zones.push(format!("### KONUŞMA ÖZETİ (LONG-TERM MEMORY)\n{session_summary}"));
    }
    if !history_str.trim().is_empty() {
        zones.push(format!("### SON YAZIŞMALAR (SHORT-TERM MEMORY)\n{history_str}"));
    }
    zones.push(format!("### KAYNAK DOKÜMANLAR (FOUND EVIDENCE)\n{evidence}"));
    zones.join("\n\n---\n\n")
}

fn style_instruction(confidence_score: f64) -> &'static str {
    if confidence_score >= 4.0 {
        "STİL: ÇÖZÜMLEYİCİ ve AKICI (Narrative Mode). Konuyu derinlemesine anlat, bağlaçlar kullan."
    } else {
        "STİL: ÖZETLEYİCİ ve TEMKİNLİ (Concise Mode). Veri az olduğu için kısa ve net yaz. Yorum katma."
    }
}

fn grounding_rule(network_status: NetworkStatus) -> &'static str {
    match network_status {
        NetworkStatus::InNetwork => {
            "KURAL: SADECE sana verilen 'BAĞLAM' içerisindeki bilgileri kullan. Kendi dış bilgini ASLA ekleme. Eğer bağlamda cevap yoksa 'Bilgi bulunamadı' de ve uydurma."
        }
        NetworkStatus::OutOfNetwork => {
            "UYARI: Kullanıcının notlarında bu konuda yeterli bilgi BULUNAMADI. Genel bilgini kullanarak cevaplayabilirsin ANCAK cevabın başında 'Notlarınızda bu konuda yeterli bilgi bulamadım, genel bilgilere dayanarak cevaplıyorum:' ibaresini MUTLAKA kullan."
        }
        NetworkStatus::Hybrid => {
            "TALİMAT: Öncelikle verilen bağlamı temel al. Ancak bağlamdaki boşlukları doldurmak, terimleri açıklamak veya akıcılığı sağlamak için genel bilgini KISITLI olarak kullanabilirsin."
        }
    }
}

/// Pick the prompt for the answer mode, confidence and network coverage.
pub fn prompt_for_mode(
    answer_mode: AnswerMode,
    context: &str,
    question: &str,
    confidence_score: f64,
    network_status: NetworkStatus,
    quote_target_count: usize,
) -> String {
    let intro = format!(
        "Sen bir düşünce ortağısın (thought partner) ve kullanıcının kişisel notlarını analiz ediyorsun.\n\n{}\n{}",
        grounding_rule(network_status),
        style_instruction(confidence_score)
    );

    match answer_mode {
        AnswerMode::Quote => format!(
            r#"{intro}

ÖNEMLİ: Bu soruda YÜKSEK GÜVENİLİRLİKLİ notlar bulundu.

İKİ AŞAMALI YANITLAMA SÜRECİ (+ İÇ KONTROL):

## AŞAMA 0: MİKRO İÇ KONTROL (Silent Self-Review)
Cevabı yazmadan önce zihninde şunları kontrol et:
1. Seçilen metinde OCR hatası (örn: "dagas1") var mı? Varsa düzelt.
2. Tam olarak {quote_target_count} adet tanım seçtin mi?
3. Kaynaklar doğru mu?

## AŞAMA 1: DOĞRUDAN ALINTI (Quote Section)
Quotability=HIGH veya Type=DEFINITION/THEORY olan notlardan KELİMESİ KELİMESİNE alıntı yap, ANCAK:

1. **OCR HATALARINI DÜZELT:** Metindeki bozuk karakterleri (örn: "dagas1" -> "doğası") düzgün Türkçe ile yaz.
2. **SADECE EN İYİ {quote_target_count} TANIMI SEÇ:** Listeyi uzatma. En alakalı ve net {quote_target_count} tanımı al.
3. Kaynak belirt: [Kaynak: Kitap Adı]

## AŞAMA 2: GENİŞ KAPSAMLI BAĞLAMSAL ANALİZ (Synthesis Section)
Quotability=MEDIUM/LOW olan notlardan sentez yap:
1. "Bağlamsal açıdan incelendiğinde..." diyerek başla.
2. Sadece notları özetleme; notlar arasındaki İLİŞKİLERİ, ZAMAN farklarını ve ORTAK TEMALARI analiz et.
3. Konuyu bireysel, toplumsal ve evrensel boyutlarıyla ele al.
4. Varsa notlardaki çelişkileri veya gelişim sürecini vurgula.

BAĞLAM (Metadata + Content):
{context}

KULLANICI SORUSU:
{question}

ZORUNLU ÇIKTI FORMATI (Bu başlıkları kullan):

## Doğrudan Tanımlar
[Buraya Quotability=HIGH notlardan verbatim alıntılar]

## Bağlamsal Analiz
[Buraya geniş kapsamlı ve çok boyutlu sentez]

## Sonuç
[Kısa özet]

CEVAP:"#
        ),
        AnswerMode::Hybrid => format!(
            r#"{intro}

ÖNEMLİ: Bu KARMAŞIK bir felsefi soru. Hem teorik tanımlar hem de bağlamsal örnekler gerekli.

HİBRİT MOD - ÇİFT AŞAMALI ANALİZ:

## AŞAMA 1: KARŞIT GÖRÜŞLER (Quote Opposing Views)
Bu konuda farklı teorik yaklaşımlar var. Her birini AYRI AYRI belirt:
1. "İlk görüşe göre..." - Type=THEORY veya Type=DEFINITION notlardan alıntı
2. "İkinci görüşe göre..." - Karşıt tanım/teoriyi alıntıla

## AŞAMA 2: GENİŞ BAĞLAMSAL KANITLAR (Contextual Evidence)
Quotability=MEDIUM notlardan durumsal ve toplumsal örnekler sentezle:
1. "Kişisel ve toplumsal bağlamda..." diyerek analizi genişlet.
2. Kavramın farklı durumlarda nasıl değiştiğini veya korunduğunu irdele.
3. Sadece örnek verme; bu örneklerin arkasındaki BÜYÜK RESMİ anlat.

## AŞAMA 3: DENGELİ SONUÇ (Balanced Conclusion)
Her iki görüşü de dikkate alarak dengeli bir sonuç sun.

BAĞLAM (Metadata + Content):
{context}

KULLANICI SORUSU:
{question}

ZORUNLU ÇIKTI FORMATI:

## Karşıt Görüşler
**Birinci Görüş:** "[AYNEN ALINTI]" [Kaynak: X]
**İkinci Görüş:** "[AYNEN ALINTI]" [Kaynak: Y]

## Bağlamsal Kanıtlar
[Durumsal, toplumsal ve geniş perspektifli sentez]

## Sonuç
[Dengeli, her iki görüşü kapsayan yorum]

CEVAP:"#
        ),
        AnswerMode::Synthesis | AnswerMode::Analytic => format!(
            r#"{intro}

DURUM: Sentez ve yorumlama modu aktif.
(Doğrudan tanım bulunamamış olabilir ancak bağlamsal kanıtlar mevcut.)

TALİMATLAR:
1. Mevcut notları birleştirerek çıkarım yap
2. "Notlarından çıkarıma göre..." ile başla
3. Kesin hüküm verme, belirsizliği ifade et
4. Kaynak göster ama doğrudan alıntı yapma
5. TÜRKÇE cevap ver

BAĞLAM (Metadata + Content):
{context}

KULLANICI SORUSU:
{question}

CEVAP (Sentez ve çıkarım):"#
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epistemic::{EpistemicAnnotation, PassageType};
    use tomehub_db::models::ChunkHit;

    fn chunk(id: &str, score: f64, level: EpistemicLevel, quotability: Quotability) -> AnnotatedChunk {
        AnnotatedChunk {
            hit: ChunkHit {
                id: id.to_string(),
                title: format!("Kitap {id}"),
                text: format!("içerik {id}"),
                source_type: "PDF_CHUNK".to_string(),
                page_number: Some(1),
                chunk_index: None,
                tags: None,
                summary: None,
                comment: None,
                book_id: None,
                normalized_text: None,
                score: 1.0,
                match_type: "content_exact".to_string(),
            },
            annotation: EpistemicAnnotation {
                answerability_score: score,
                level,
                quotability,
                passage_type: PassageType::Situational,
                ..EpistemicAnnotation::default()
            },
        }
    }

    #[test]
    fn context_selects_by_score_and_keeps_input_order_for_used() {
        let chunks: Vec<AnnotatedChunk> = (0..20)
            .map(|i| chunk(&i.to_string(), i as f64, EpistemicLevel::B, Quotability::Medium))
            .collect();
        let (context, used) = build_epistemic_context(&chunks);
        assert_eq!(used.len(), 12);
        // The prompt presents the strongest evidence first.
        assert!(context.contains("[ID: 1 | Score: 19/7"));
        // The returned selection stays in the caller's (post-fusion) order:
        // the 12 highest-scoring chunks, original positions preserved.
        assert_eq!(used[0].hit.id, "8");
        assert_eq!(used[11].hit.id, "19");
        let positions: Vec<f64> = used.iter().map(|c| c.annotation.answerability_score).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn markers_follow_level_and_quotability() {
        let chunks = vec![
            chunk("a", 5.0, EpistemicLevel::A, Quotability::High),
            chunk("b", 1.0, EpistemicLevel::B, Quotability::Medium),
            chunk("c", 0.0, EpistemicLevel::C, Quotability::Low),
        ];
        let (context, _) = build_epistemic_context(&chunks);
        assert!(context.contains("★★★ DOĞRUDAN ALINTI YAP"));
        assert!(context.contains("★★ BAĞLAMDA KULLAN"));
        assert!(context.contains("★ SENTEZ YAP"));
    }

    #[test]
    fn quote_prompt_contains_required_headings() {
        let prompt = prompt_for_mode(
            AnswerMode::Quote,
            "bağlam",
            "vicdan nedir",
            4.3,
            NetworkStatus::InNetwork,
            4,
        );
        assert!(prompt.contains("## Doğrudan Tanımlar"));
        assert!(prompt.contains("## Bağlamsal Analiz"));
        assert!(prompt.contains("## Sonuç"));
        assert!(prompt.contains("4 adet tanım"));
        assert!(prompt.contains("ÇÖZÜMLEYİCİ"));
    }

    #[test]
    fn out_of_network_prompt_requires_disclaimer() {
        let prompt = prompt_for_mode(
            AnswerMode::Synthesis,
            "bağlam",
            "soru",
            2.0,
            NetworkStatus::OutOfNetwork,
            2,
        );
        assert!(prompt.contains("Notlarınızda bu konuda yeterli bilgi bulamadım"));
        assert!(prompt.contains("TEMKİNLİ"));
    }

    #[test]
    fn memory_zones_are_labelled() {
        let full = build_memory_zones("özet", "geçmiş", "kanıt");
        assert!(full.contains("KONUŞMA ÖZETİ (LONG-TERM MEMORY)"));
        assert!(full.contains("SON YAZIŞMALAR (SHORT-TERM MEMORY)"));
        assert!(full.contains("KAYNAK DOKÜMANLAR (FOUND EVIDENCE)"));

        let minimal = build_memory_zones("", "", "kanıt");
        assert!(!minimal.contains("LONG-TERM"));
        assert!(minimal.contains("FOUND EVIDENCE"));
    }
}
