//! Deterministic offline model and search tool.
//!
//! Used by `--offline` runs and by tests. Scripted replies are consumed per
//! purpose first; afterwards a heuristic reply is derived from the request.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

use crate::citations::extract_urls;
use crate::error::{ModelError, ToolError};
use crate::events::preview;
use crate::language::Language;
use crate::model::{ModelInvoker, ModelRequest, Purpose};
use crate::state::{Role, SourceRef};
use crate::tools::{Tool, ToolOutput};

const BRIEF_PREFIX: &str = "I want a comprehensive report on: ";

static ENGLISH_COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*compare\s+(.+?)\s+(?:and|vs\.?|versus|with)\s+(.+?)[\s?.!]*$")
        .expect("invalid comparison regex")
});

static CHINESE_COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*比较(.+?)(?:和|与|跟)(.+?)(?:的.*)?[\s？?。]*$").expect("invalid comparison regex")
});

static TOOL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^- `([^`]+)`").expect("invalid tool line regex"));

#[derive(Debug, Clone)]
pub enum StubReply {
    Text(String),
    Error(ModelError),
}

impl StubReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn json(value: Value) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Default)]
pub struct StubModel {
    scripted: DashMap<Purpose, VecDeque<StubReply>>,
    calls: DashMap<Purpose, usize>,
}

impl StubModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, purpose: Purpose, reply: StubReply) -> Self {
        self.push_reply(purpose, reply);
        self
    }

    pub fn push_reply(&self, purpose: Purpose, reply: StubReply) {
        self.scripted.entry(purpose).or_default().push_back(reply);
    }

    pub fn calls(&self, purpose: Purpose) -> usize {
        self.calls.get(&purpose).map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl ModelInvoker for StubModel {
    async fn generate(&self, request: ModelRequest) -> Result<String, ModelError> {
        *self.calls.entry(request.purpose).or_insert(0) += 1;

        let scripted = self
            .scripted
            .get_mut(&request.purpose)
            .and_then(|mut queue| queue.pop_front());
        if let Some(reply) = scripted {
            return match reply {
                StubReply::Text(text) => Ok(text),
                StubReply::Error(err) => Err(err),
            };
        }

        Ok(match request.purpose {
            Purpose::Clarify => json!({
                "need_clarification": false,
                "question": "",
                "verification": "Understood. Starting research now."
            })
            .to_string(),
            Purpose::Brief => brief_reply(&request),
            Purpose::Supervise => supervise_reply(&request),
            Purpose::Research => research_reply(&request),
            Purpose::Compress => between(&last_user(&request), "<Transcript>\n", "\n</Transcript>")
                .unwrap_or_default()
                .to_string(),
            Purpose::Report => report_reply(&request),
        })
    }
}

fn last_user(request: &ModelRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.content.clone())
        .unwrap_or_default()
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let to = text[from..].find(end)? + from;
    Some(&text[from..to])
}

fn brief_reply(request: &ModelRequest) -> String {
    let system = request.system.as_deref().unwrap_or_default();
    let question = system
        .lines()
        .find_map(|line| line.strip_prefix("user: "))
        .unwrap_or("the requested topic");
    json!({ "research_brief": format!("{BRIEF_PREFIX}{question}") }).to_string()
}

fn supervise_reply(request: &ModelRequest) -> String {
    let finished_round = request.messages.iter().any(|message| {
        message.role == Role::User && message.content.starts_with("Delegation round")
    });
    if finished_round {
        return json!({ "action": "research_complete" }).to_string();
    }

    let brief = request
        .messages
        .first()
        .map(|message| message.content.as_str())
        .unwrap_or_default();
    let brief = brief.strip_prefix("Research brief:\n").unwrap_or(brief).trim();
    let subject = brief.strip_prefix(BRIEF_PREFIX).unwrap_or(brief).trim();

    let topics: Vec<String> = match split_comparison(subject) {
        Some(items) => items
            .into_iter()
            .map(|item| format!("{item}: research this in the context of \"{subject}\""))
            .collect(),
        None => vec![subject.to_string()],
    };
    json!({ "action": "conduct_research", "topics": topics }).to_string()
}

fn split_comparison(subject: &str) -> Option<Vec<String>> {
    let caps = ENGLISH_COMPARISON
        .captures(subject)
        .or_else(|| CHINESE_COMPARISON.captures(subject))?;
    Some(vec![caps[1].trim().to_string(), caps[2].trim().to_string()])
}

fn research_reply(request: &ModelRequest) -> String {
    let last = last_user(request);
    if last.starts_with("Tool results") {
        return json!({ "action": "reflect", "reflection": "The results cover the topic." })
            .to_string();
    }
    let searched = request.messages.iter().any(|message| {
        message.role == Role::User && message.content.starts_with("Tool results")
    });
    let system = request.system.as_deref().unwrap_or_default();
    let tool = TOOL_LINE.captures(system).map(|caps| caps[1].to_string());

    match tool {
        Some(tool) if !searched => {
            let topic = request
                .messages
                .first()
                .map(|message| message.content.as_str())
                .unwrap_or_default();
            let topic = topic.strip_prefix("Research topic:\n").unwrap_or(topic);
            json!({
                "action": "use_tools",
                "calls": [{ "tool": tool, "args": { "query": topic } }]
            })
            .to_string()
        }
        _ => json!({ "action": "finish" }).to_string(),
    }
}

struct ReportTemplate {
    title: &'static str,
    overview: (&'static str, &'static str),
    findings_heading: &'static str,
    finding: fn(usize, &str) -> String,
    no_sources: &'static str,
    conclusion: (&'static str, &'static str),
}

fn template(language: Language) -> ReportTemplate {
    match language {
        Language::English | Language::Other => ReportTemplate {
            title: "Research Report",
            overview: (
                "Overview",
                "This overview collects the main points gathered on the question and presents them with their sources.",
            ),
            findings_heading: "Key Findings",
            finding: |i, url| format!("- Finding {i} is documented by [Source {i}]({url})."),
            no_sources: "No sources were gathered.",
            conclusion: (
                "Conclusion",
                "The gathered evidence gives a consistent picture of the topic.",
            ),
        },
        Language::French => ReportTemplate {
            title: "Rapport de recherche",
            overview: (
                "Aperçu",
                "Cet aperçu rassemble les points principaux recueillis sur la question et les présente avec leurs sources.",
            ),
            findings_heading: "Principaux résultats",
            finding: |i, url| format!("- Le résultat {i} est documenté par la [source {i}]({url})."),
            no_sources: "Aucune source n'a été recueillie.",
            conclusion: (
                "Conclusion",
                "Les éléments recueillis donnent une image cohérente du sujet.",
            ),
        },
        Language::Spanish => ReportTemplate {
            title: "Informe de investigación",
            overview: (
                "Resumen",
                "Este resumen reúne los puntos principales sobre la pregunta y los presenta con sus fuentes.",
            ),
            findings_heading: "Hallazgos principales",
            finding: |i, url| format!("- El hallazgo {i} está documentado en la [fuente {i}]({url})."),
            no_sources: "No se recopilaron fuentes.",
            conclusion: (
                "Conclusión",
                "Las pruebas reunidas dan una imagen coherente del tema.",
            ),
        },
        Language::German => ReportTemplate {
            title: "Recherchebericht",
            overview: (
                "Überblick",
                "Dieser Überblick fasst die wichtigsten Punkte zu der Frage zusammen und nennt die Quellen.",
            ),
            findings_heading: "Wichtigste Ergebnisse",
            finding: |i, url| format!("- Ergebnis {i} ist in der [Quelle {i}]({url}) belegt."),
            no_sources: "Es wurden keine Quellen gefunden.",
            conclusion: (
                "Fazit",
                "Die gesammelten Belege ergeben ein stimmiges Bild des Themas.",
            ),
        },
        Language::Portuguese => ReportTemplate {
            title: "Relatório de pesquisa",
            overview: (
                "Visão geral",
                "Esta visão geral reúne os pontos principais sobre a pergunta e os apresenta com as fontes.",
            ),
            findings_heading: "Principais conclusões",
            finding: |i, url| format!("- A conclusão {i} é documentada pela [fonte {i}]({url})."),
            no_sources: "Nenhuma fonte foi encontrada.",
            conclusion: (
                "Conclusão",
                "As evidências reunidas dão uma imagem coerente do tema.",
            ),
        },
        Language::Italian => ReportTemplate {
            title: "Rapporto di ricerca",
            overview: (
                "Panoramica",
                "Questa panoramica raccoglie i punti principali sulla domanda e li presenta con le fonti.",
            ),
            findings_heading: "Risultati principali",
            finding: |i, url| format!("- Il risultato {i} è documentato dalla [fonte {i}]({url})."),
            no_sources: "Non sono state raccolte fonti.",
            conclusion: (
                "Conclusione",
                "Le prove raccolte danno un quadro coerente del tema.",
            ),
        },
        Language::Chinese => ReportTemplate {
            title: "研究报告",
            overview: (
                "概述",
                "本文汇总了围绕该问题收集到的主要信息，并注明了相应的信息来源。",
            ),
            findings_heading: "主要发现",
            finding: |i, url| format!("- 第{i}条发现见 [来源 {i}]({url})。"),
            no_sources: "未收集到信息源。",
            conclusion: ("结论", "现有资料对该主题给出了较为一致的结论。"),
        },
        Language::Japanese => ReportTemplate {
            title: "調査レポート",
            overview: ("概要", "この文書は収集した情報とその出典をまとめたものです。"),
            findings_heading: "主な発見",
            finding: |i, url| format!("- 発見{i}は[出典 {i}]({url})に記載されています。"),
            no_sources: "情報源は収集されませんでした。",
            conclusion: (
                "結論",
                "収集した資料はこのテーマについて一貫した見解を示しています。",
            ),
        },
        Language::Korean => ReportTemplate {
            title: "조사 보고서",
            overview: ("개요", "수집한 주요 정보와 출처를 정리했습니다."),
            findings_heading: "주요 발견",
            finding: |i, url| format!("- 발견 {i}: [출처 {i}]({url})"),
            no_sources: "수집된 출처가 없습니다.",
            conclusion: ("결론", "수집된 자료는 이 주제에 대해 일관된 결론을 보여 줍니다."),
        },
        Language::Russian => ReportTemplate {
            title: "Исследовательский отчёт",
            overview: (
                "Обзор",
                "Собраны основные сведения по вопросу с указанием источников.",
            ),
            findings_heading: "Основные выводы",
            finding: |i, url| format!("- Вывод {i} подтверждается [источник {i}]({url})."),
            no_sources: "Источники не найдены.",
            conclusion: (
                "Заключение",
                "Собранные материалы дают согласованную картину темы.",
            ),
        },
    }
}

fn report_reply(request: &ModelRequest) -> String {
    let template = template(request.language.unwrap_or_default());
    let user = last_user(request);
    let findings = between(&user, "<Findings>\n", "\n</Findings>").unwrap_or_default();
    let urls = extract_urls(findings);

    let findings_body = if urls.is_empty() {
        template.no_sources.to_string()
    } else {
        urls.iter()
            .enumerate()
            .map(|(idx, url)| (template.finding)(idx + 1, url))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# {}\n\n## {}\n\n{}\n\n## {}\n\n{}\n\n## {}\n\n{}\n",
        template.title,
        template.overview.0,
        template.overview.1,
        template.findings_heading,
        findings_body,
        template.conclusion.0,
        template.conclusion.1,
    )
}

/// Offline search returning two deterministic example.com pages per query.
#[derive(Debug, Default, Clone)]
pub struct StubSearchTool;

#[async_trait]
impl Tool for StubSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for a query and return matching pages."
    }

    fn parameters(&self) -> Value {
        json!({ "query": "string" })
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| ToolError::invalid_arguments("web_search", "missing string field `query`"))?;

        let slug = slug(query);
        let label = preview(query, 60);
        Ok(ToolOutput::new(format!(
            "Two reference pages discuss \"{label}\": an overview and a detailed write-up."
        ))
        .with_source(SourceRef::new(
            format!("{label} overview"),
            format!("https://example.com/{slug}/overview"),
        ))
        .with_source(SourceRef::new(
            format!("{label} details"),
            format!("https://example.com/{slug}/details"),
        )))
    }
}

/// Lowercase ascii words joined by dashes; non-ascii queries get a stable
/// hash instead.
fn slug(query: &str) -> String {
    let words: Vec<String> = query
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .take(8)
        .map(str::to_ascii_lowercase)
        .collect();
    if !words.is_empty() {
        return words.join("-");
    }
    let hash = query
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    format!("topic-{hash:016x}")
}
