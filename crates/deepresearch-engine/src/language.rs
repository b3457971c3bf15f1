//! Language detection and the handful of localized labels the engine writes
//! into reports itself.
//!
//! CJK, Cyrillic and other non-Latin scripts are recognised by script.
//! Latin-script text is scored against short function-word lists; Latin text
//! that matches none of them is `Other`, and the report is then asked to
//! follow the question's language without a strict check.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    English,
    French,
    Spanish,
    German,
    Portuguese,
    Italian,
    Chinese,
    Japanese,
    Korean,
    Russian,
    /// Recognisably not one of the above.
    Other,
}

/// Function words per Latin-script language, lowercase.
const FUNCTION_WORDS: &[(Language, &[&str])] = &[
    (
        Language::English,
        &[
            "the", "and", "of", "to", "in", "is", "are", "was", "were", "what", "how", "which",
            "with", "for", "on", "by", "this", "that", "be", "it", "from", "as", "an", "or",
            "a", "why", "does", "do", "between", "their", "them",
        ],
    ),
    (
        Language::French,
        &[
            "le", "la", "les", "des", "du", "et", "est", "sont", "une", "un", "pour", "dans",
            "avec", "que", "qui", "quels", "quelles", "quel", "quelle", "comment", "pourquoi",
            "entre", "sur", "au", "aux", "ce", "cette", "ces", "pas", "de", "l", "d", "qu",
        ],
    ),
    (
        Language::Spanish,
        &[
            "el", "la", "los", "las", "del", "y", "es", "son", "una", "un", "para", "en", "con",
            "que", "cuál", "cuáles", "cómo", "por", "qué", "entre", "frente", "sobre", "al",
            "lo", "este", "esta", "de", "a",
        ],
    ),
    (
        Language::German,
        &[
            "der", "die", "das", "und", "ist", "sind", "ein", "eine", "für", "mit", "von", "zu",
            "im", "den", "dem", "wie", "was", "welche", "warum", "zwischen", "nicht", "auf",
            "auch", "oder",
        ],
    ),
    (
        Language::Portuguese,
        &[
            "o", "os", "as", "da", "do", "das", "dos", "e", "é", "são", "uma", "um", "para",
            "em", "com", "que", "qual", "quais", "como", "por", "entre", "sobre", "no", "na",
            "nos", "de", "não", "ao", "a",
        ],
    ),
    (
        Language::Italian,
        &[
            "il", "lo", "gli", "della", "delle", "dei", "e", "è", "sono", "una", "un", "per",
            "in", "con", "che", "quali", "quale", "come", "perché", "tra", "fra", "sul", "nel",
            "di", "del", "non", "i", "a",
        ],
    ),
];

#[derive(Default)]
struct ScriptCounts {
    han: usize,
    kana: usize,
    hangul: usize,
    cyrillic_words: usize,
    latin_words: usize,
    /// Words in any other alphabetic script (Arabic, Greek, Devanagari, ...).
    other_words: usize,
    non_ascii_latin: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Cyrillic,
    Other,
}

fn count_scripts(text: &str) -> ScriptCounts {
    let mut counts = ScriptCounts::default();
    let mut current: Option<Script> = None;

    for ch in text.chars() {
        let script = match ch {
            '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' => {
                counts.han += 1;
                None
            }
            '\u{3040}'..='\u{30FF}' => {
                counts.kana += 1;
                None
            }
            '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' => {
                counts.hangul += 1;
                None
            }
            '\u{0400}'..='\u{04FF}' => Some(Script::Cyrillic),
            _ if ch.is_ascii_alphabetic() => Some(Script::Latin),
            '\u{00C0}'..='\u{024F}' if ch.is_alphabetic() => {
                counts.non_ascii_latin += 1;
                Some(Script::Latin)
            }
            _ if ch.is_alphabetic() => Some(Script::Other),
            _ => None,
        };

        if script.is_some() && script != current {
            match script {
                Some(Script::Latin) => counts.latin_words += 1,
                Some(Script::Cyrillic) => counts.cyrillic_words += 1,
                Some(Script::Other) => counts.other_words += 1,
                None => {}
            }
        }
        current = script;
    }

    counts
}

/// Count function-word hits per Latin-script language.
fn function_word_scores(text: &str) -> Vec<(Language, usize)> {
    let words: Vec<String> = text
        .split(|ch: char| !ch.is_alphabetic())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    FUNCTION_WORDS
        .iter()
        .map(|(language, list)| {
            let hits = words
                .iter()
                .filter(|word| list.contains(&word.as_str()))
                .count();
            (*language, hits)
        })
        .collect()
}

fn detect_latin(text: &str, counts: &ScriptCounts) -> Language {
    let scores = function_word_scores(text);
    let english = scores
        .iter()
        .find(|(language, _)| *language == Language::English)
        .map(|(_, hits)| *hits)
        .unwrap_or(0);
    let best = scores
        .iter()
        .filter(|(language, _)| *language != Language::English)
        .fold(None::<(Language, usize)>, |best, &(language, hits)| match best {
            Some((_, top)) if top >= hits => best,
            _ => Some((language, hits)),
        });

    match best {
        Some((language, hits)) if hits >= 2 && hits > english => language,
        _ if english == 0 && counts.non_ascii_latin > 0 => Language::Other,
        _ => Language::English,
    }
}

impl Language {
    /// Guess the language of `text`. CJK characters are weighed against Latin
    /// words, so a Chinese sentence quoting a few English product names is
    /// still Chinese.
    pub fn detect(text: &str) -> Self {
        let counts = count_scripts(text);

        if counts.kana > 0 && counts.kana + counts.han >= counts.latin_words.max(1) {
            return Language::Japanese;
        }
        if counts.hangul > 0 && counts.hangul >= counts.latin_words.max(1) {
            return Language::Korean;
        }
        if counts.han > 0 && counts.han >= counts.latin_words.max(1) {
            return Language::Chinese;
        }
        if counts.cyrillic_words > 0 && counts.cyrillic_words >= counts.latin_words {
            return Language::Russian;
        }
        if counts.other_words > 0 && counts.other_words >= counts.latin_words {
            return Language::Other;
        }
        detect_latin(text, &counts)
    }

    /// Human-readable name used in prompts.
    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::French => "French (français)",
            Language::Spanish => "Spanish (español)",
            Language::German => "German (Deutsch)",
            Language::Portuguese => "Portuguese (português)",
            Language::Italian => "Italian (italiano)",
            Language::Chinese => "Chinese (简体中文)",
            Language::Japanese => "Japanese (日本語)",
            Language::Korean => "Korean (한국어)",
            Language::Russian => "Russian (русский)",
            Language::Other => "the language of the user's first message",
        }
    }

    /// Whether a report can be checked for this language. `Other` cannot.
    pub fn is_verifiable(&self) -> bool {
        *self != Language::Other
    }

    pub fn is_cjk(&self) -> bool {
        matches!(
            self,
            Language::Chinese | Language::Japanese | Language::Korean
        )
    }

    pub fn sources_heading(&self) -> &'static str {
        match self {
            Language::English | Language::Other => "Sources",
            Language::French => "Sources",
            Language::Spanish => "Fuentes",
            Language::German => "Quellen",
            Language::Portuguese => "Fontes",
            Language::Italian => "Fonti",
            Language::Chinese => "信息源",
            Language::Japanese => "参考資料",
            Language::Korean => "출처",
            Language::Russian => "Источники",
        }
    }

    pub fn coverage_gaps_heading(&self) -> &'static str {
        match self {
            Language::English | Language::Other => "Research Coverage Gaps",
            Language::French => "Lacunes de la recherche",
            Language::Spanish => "Lagunas de la investigación",
            Language::German => "Lücken der Recherche",
            Language::Portuguese => "Lacunas da pesquisa",
            Language::Italian => "Lacune della ricerca",
            Language::Chinese => "研究覆盖缺口",
            Language::Japanese => "調査の不足範囲",
            Language::Korean => "조사 공백",
            Language::Russian => "Пробелы в исследовании",
        }
    }

    /// Lead-in sentence for the coverage-gap section; the gap details follow
    /// as a list.
    pub fn coverage_gaps_intro(&self) -> &'static str {
        match self {
            Language::English | Language::Other => {
                "Some research directions could not be covered because their sources were unavailable:"
            }
            Language::French => {
                "Certaines pistes de recherche n'ont pas pu être couvertes car leurs sources étaient indisponibles :"
            }
            Language::Spanish => {
                "Algunas líneas de investigación no se pudieron cubrir porque sus fuentes no estaban disponibles:"
            }
            Language::German => {
                "Einige Rechercherichtungen konnten nicht abgedeckt werden, weil ihre Quellen nicht verfügbar waren:"
            }
            Language::Portuguese => {
                "Algumas linhas de pesquisa não puderam ser cobertas porque as fontes estavam indisponíveis:"
            }
            Language::Italian => {
                "Alcune direzioni di ricerca non sono state coperte perché le fonti non erano disponibili:"
            }
            Language::Chinese => "以下研究方向因信息源不可用而未能完整覆盖：",
            Language::Japanese => "以下の調査項目は情報源が利用できなかったため十分に調査できませんでした：",
            Language::Korean => "다음 조사 항목은 출처를 사용할 수 없어 충분히 다루지 못했습니다:",
            Language::Russian => {
                "Некоторые направления исследования не удалось охватить, так как источники были недоступны:"
            }
        }
    }

    /// Localized label for a subtopic that produced no findings.
    pub fn missing_topic_label(&self) -> &'static str {
        match self {
            Language::English | Language::Other => "research direction",
            Language::French => "piste de recherche",
            Language::Spanish => "línea de investigación",
            Language::German => "Rechercherichtung",
            Language::Portuguese => "linha de pesquisa",
            Language::Italian => "direzione di ricerca",
            Language::Chinese => "研究方向",
            Language::Japanese => "調査項目",
            Language::Korean => "조사 항목",
            Language::Russian => "направление",
        }
    }
}

/// Amount of prose in `text`: words for space-delimited scripts, characters
/// for CJK.
pub fn text_units(text: &str) -> usize {
    let counts = count_scripts(text);
    counts.han
        + counts.kana
        + counts.hangul
        + counts.latin_words
        + counts.cyrillic_words
        + counts.other_words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dominant_script() {
        assert_eq!(Language::detect("Compare Rust and Go"), Language::English);
        assert_eq!(
            Language::detect("比较 Rust 和 Go 的并发模型"),
            Language::Chinese
        );
        assert_eq!(Language::detect("東京のラーメン店を比較して"), Language::Japanese);
        assert_eq!(Language::detect("서울의 날씨"), Language::Korean);
        assert_eq!(Language::detect("история Москвы"), Language::Russian);
        assert_eq!(Language::detect(""), Language::English);
    }

    #[test]
    fn latin_languages_are_told_apart_by_function_words() {
        assert_eq!(
            Language::detect("Comparez les modèles de concurrence de Rust et de Go"),
            Language::French
        );
        assert_eq!(
            Language::detect("¿Cuáles son las ventajas de Rust frente a Go?"),
            Language::Spanish
        );
        assert_eq!(
            Language::detect("Wie funktioniert der Borrow-Checker in Rust?"),
            Language::German
        );
        assert_eq!(
            Language::detect("Quais são as vantagens do Rust em relação ao Go?"),
            Language::Portuguese
        );
        assert_eq!(
            Language::detect("Quali sono i vantaggi di Rust rispetto a Go?"),
            Language::Italian
        );
        assert_eq!(
            Language::detect("What are the trade-offs between Rust and Go?"),
            Language::English
        );
    }

    #[test]
    fn unknown_languages_are_other_not_english() {
        assert_eq!(Language::detect("Porównaj współbieżność Rust i Go"), Language::Other);
        assert_eq!(Language::detect("قارن بين Rust و Go"), Language::Other);
        assert!(!Language::Other.is_verifiable());
        assert!(Language::French.is_verifiable());
    }

    #[test]
    fn text_units_counts_characters_for_cjk() {
        assert_eq!(text_units("one two three"), 3);
        assert_eq!(text_units("并发模型"), 4);
        assert_eq!(text_units("Rust 并发"), 3);
        assert_eq!(text_units("les modèles déjà"), 3);
    }
}
