//! Global citation numbering for the final report.
//!
//! The report model writes `[Title](URL)` links. Here every distinct url is
//! given a sequential id in order of first appearance, links and bare urls are
//! rewritten to `[n]` markers, and the trailing sources list is rendered.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static CITATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[(?P<label>[^\[\]\n]+)\]\((?P<link>(?:https?|file)://(?:[^\s()]+|\([^\s()]*\))+)\)|(?P<stale>\[\d+(?:\s*,\s*\d+)*\])|(?P<bare>(?:https?|file)://(?:[A-Za-z0-9\-._~:/?#@!$&'*+,;=%]+|\([A-Za-z0-9\-._~:/?#@!$&'*+,;=%]*\))+)",
    )
    .expect("invalid citation regex")
});

static LEGACY_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:[-*]\s*)?\[(?P<id>\d+)\]\s*(?P<title>.*?)\s*[:：]?\s*(?P<url>(?:https?|file)://\S+)\s*$",
    )
    .expect("invalid sources entry regex")
});

static MARKER_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("invalid regex"));

/// Fenced blocks (an unclosed fence runs to the end) and inline code spans.
static CODE_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?(?:```|\z)|`[^`\n]+`").expect("invalid code span regex"));

const SOURCE_HEADINGS: &[&str] = &[
    "sources",
    "source list",
    "references",
    "bibliography",
    "citations",
    "信息源",
    "信息来源",
    "参考资料",
    "参考文献",
    "来源",
    "参考資料",
    "출처",
    "참고 자료",
    "источники",
    "список источников",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub id: usize,
    pub title: String,
    pub url: String,
}

/// url → sequential id; ids are 1..N in order of registration.
#[derive(Debug, Clone, Default)]
pub struct CitationRegistry {
    ids: HashMap<String, usize>,
    entries: Vec<Citation>,
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `url`, assigning the next one on first sight.
    pub fn register(&mut self, url: &str, title: impl FnOnce() -> String) -> usize {
        if let Some(id) = self.ids.get(url) {
            return *id;
        }
        let id = self.entries.len() + 1;
        self.ids.insert(url.to_string(), id);
        self.entries.push(Citation {
            id,
            title: title(),
            url: url.to_string(),
        });
        id
    }

    pub fn id_of(&self, url: &str) -> Option<usize> {
        self.ids.get(url).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Citation] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Citation> {
        self.entries
    }
}

/// An entry from a sources list the model wrote itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedSource {
    pub id: usize,
    pub title: String,
    pub url: String,
}

/// Cut a model-written sources section off the end of `markdown`.
///
/// Only the last heading is considered, so a "References" chapter followed by
/// more content is left alone. Parsed entries are returned so numeric markers
/// that point into the old list can still be resolved.
pub fn strip_trailing_sources(markdown: &str) -> (String, Vec<ListedSource>) {
    let mut offset = 0;
    let mut last_heading: Option<(usize, &str)> = None;
    for line in markdown.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            last_heading = Some((offset, line));
        }
        offset += line.len();
    }

    let Some((start, heading)) = last_heading else {
        return (markdown.trim_end().to_string(), Vec::new());
    };

    let title = heading
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_end_matches([':', '：'])
        .trim_matches('*')
        .trim()
        .to_lowercase();
    if !SOURCE_HEADINGS.contains(&title.as_str()) {
        return (markdown.trim_end().to_string(), Vec::new());
    }

    let listed = markdown[start + heading.len()..]
        .lines()
        .filter_map(|line| {
            let caps = LEGACY_ENTRY.captures(line)?;
            let id = caps["id"].parse().ok()?;
            Some(ListedSource {
                id,
                title: caps["title"].trim().to_string(),
                url: trim_url(&caps["url"]).0.to_string(),
            })
        })
        .collect();

    (markdown[..start].trim_end().to_string(), listed)
}

/// Rewrite citations in `body` to sequential `[n]` markers.
///
/// `known_titles` maps url → title as gathered by researchers; `listed` is the
/// model's own stripped sources list. A bracketed number is only treated as a
/// stale marker when `listed` resolves it and it does not index into an
/// identifier (`arr[1]`). Code spans and fenced blocks are left untouched.
pub fn renumber(
    body: &str,
    known_titles: &HashMap<String, String>,
    listed: &[ListedSource],
) -> (String, CitationRegistry) {
    let mut registry = CitationRegistry::new();
    let mut rewritten = String::with_capacity(body.len());
    let mut last = 0;

    for code in CODE_SPAN.find_iter(body) {
        rewritten.push_str(&renumber_prose(
            &body[last..code.start()],
            known_titles,
            listed,
            &mut registry,
        ));
        rewritten.push_str(code.as_str());
        last = code.end();
    }
    rewritten.push_str(&renumber_prose(&body[last..], known_titles, listed, &mut registry));

    (rewritten, registry)
}

fn renumber_prose(
    prose: &str,
    known_titles: &HashMap<String, String>,
    listed: &[ListedSource],
    registry: &mut CitationRegistry,
) -> String {
    CITATION_PATTERN
        .replace_all(prose, |caps: &Captures| {
            if let (Some(label), Some(link)) = (caps.name("label"), caps.name("link")) {
                let label = label.as_str().trim();
                let url = link.as_str();
                let id = registry.register(url, || resolve_title(url, Some(label), known_titles));
                let label_is_marker = label.chars().all(|ch| ch.is_ascii_digit()) || label == url;
                return if label_is_marker {
                    format!("[{id}]")
                } else {
                    format!("{label} [{id}]")
                };
            }

            if let Some(stale) = caps.name("stale") {
                let indexes_identifier = prose[..stale.start()]
                    .chars()
                    .next_back()
                    .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_');
                if indexes_identifier {
                    return stale.as_str().to_string();
                }
                let entries: Vec<&ListedSource> = MARKER_NUMBER
                    .find_iter(stale.as_str())
                    .filter_map(|number| number.as_str().parse::<usize>().ok())
                    .filter_map(|old| listed.iter().find(|entry| entry.id == old))
                    .collect();
                if entries.is_empty() {
                    return stale.as_str().to_string();
                }
                return entries
                    .into_iter()
                    .map(|entry| {
                        let title = entry.title.clone();
                        let id = registry.register(&entry.url, || {
                            known_titles
                                .get(&entry.url)
                                .cloned()
                                .filter(|known| !known.trim().is_empty())
                                .or_else(|| Some(title).filter(|title| !title.is_empty()))
                                .unwrap_or_else(|| host_of(&entry.url))
                        });
                        format!("[{id}]")
                    })
                    .collect();
            }

            if let Some(bare) = caps.name("bare") {
                let (url, tail) = trim_url(bare.as_str());
                let id = registry.register(url, || resolve_title(url, None, known_titles));
                return format!("[{id}]{tail}");
            }

            caps[0].to_string()
        })
        .into_owned()
}

/// Render the trailing `[n] Title: url` list. Empty when nothing was cited.
pub fn render_sources_section(registry: &CitationRegistry, heading: &str) -> String {
    if registry.is_empty() {
        return String::new();
    }
    let lines = registry
        .entries()
        .iter()
        .map(|citation| format!("[{}] {}: {}", citation.id, citation.title, citation.url))
        .collect::<Vec<_>>()
        .join("\n");
    format!("### {heading}\n\n{lines}")
}

/// Every http(s)/file url in `text`, in order, without duplicates.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for caps in CITATION_PATTERN.captures_iter(text) {
        let url = if let Some(link) = caps.name("link") {
            link.as_str()
        } else if let Some(bare) = caps.name("bare") {
            trim_url(bare.as_str()).0
        } else {
            continue;
        };
        if !urls.iter().any(|known| known == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// `text` with links reduced to their labels and urls removed, for measuring
/// prose.
pub fn without_urls(text: &str) -> String {
    CITATION_PATTERN
        .replace_all(text, |caps: &Captures| {
            caps.name("label")
                .filter(|_| caps.name("link").is_some())
                .map(|label| label.as_str().to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

fn resolve_title(url: &str, label: Option<&str>, known_titles: &HashMap<String, String>) -> String {
    if let Some(title) = known_titles.get(url).filter(|title| !title.trim().is_empty()) {
        return title.trim().to_string();
    }
    if let Some(label) = label.filter(|label| {
        !label.is_empty() && *label != url && !label.chars().all(|ch| ch.is_ascii_digit())
    }) {
        return label.to_string();
    }
    host_of(url)
}

fn trim_url(raw: &str) -> (&str, &str) {
    let trimmed = raw.trim_end_matches(['.', ',', ';', ':', '!', '?', '\'', '*']);
    (trimmed, &raw[trimmed.len()..])
}

fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if !host.is_empty() {
        return host.to_string();
    }
    rest.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titles() -> HashMap<String, String> {
        HashMap::from([("https://a.example/x".to_string(), "Alpha".to_string())])
    }

    #[test]
    fn numbers_follow_first_appearance() {
        let body = "# T\n\nRust is fast [Alpha docs](https://a.example/x). \
                    See https://b.example/y. Again [1](https://a.example/x) [7].";

        let (text, registry) = renumber(body, &titles(), &[]);

        assert_eq!(
            text,
            "# T\n\nRust is fast Alpha docs [1]. See [2]. Again [1] [7]."
        );
        let ids: Vec<usize> = registry.entries().iter().map(|c| c.id).collect();
        assert_eq!(ids, [1, 2]);

        insta::assert_snapshot!(render_sources_section(&registry, "Sources"), @r"
        ### Sources

        [1] Alpha: https://a.example/x
        [2] b.example: https://b.example/y
        ");
    }

    #[test]
    fn stale_markers_resolve_through_listed_sources() {
        let draft = "# Report\n\nClaim one [2]. Claim two [1, 2].\n\n### Sources\n\
                     [1] First: https://one.example\n[2] Second: https://two.example\n";

        let (body, listed) = strip_trailing_sources(draft);
        assert_eq!(body, "# Report\n\nClaim one [2]. Claim two [1, 2].");
        assert_eq!(listed.len(), 2);

        let (text, registry) = renumber(&body, &HashMap::new(), &listed);
        assert_eq!(text, "# Report\n\nClaim one [1]. Claim two [2][1].");
        assert_eq!(registry.entries()[0].title, "Second");
        assert_eq!(registry.entries()[1].url, "https://one.example");
    }

    #[test]
    fn keeps_sections_that_are_not_source_lists() {
        let draft = "# Report\n\n## References in law\n\nText.";
        let (body, listed) = strip_trailing_sources(draft);
        assert_eq!(body, draft);
        assert!(listed.is_empty());

        let localized = "# 报告\n\n正文。\n\n### 信息源\n[1] 标题：https://cn.example/a\n";
        let (body, listed) = strip_trailing_sources(localized);
        assert_eq!(body, "# 报告\n\n正文。");
        assert_eq!(listed[0].url, "https://cn.example/a");
    }

    #[test]
    fn urls_keep_balanced_parentheses() {
        let url = "https://en.wikipedia.org/wiki/Rust_(programming_language)";
        let titles = HashMap::from([(url.to_string(), "Rust (programming language)".to_string())]);
        let body = format!("Rust is memory safe [Wikipedia]({url}). See also {url} (the article).");

        let (text, registry) = renumber(&body, &titles, &[]);

        assert_eq!(text, "Rust is memory safe Wikipedia [1]. See also [1] (the article).");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries()[0].url, url);
        assert_eq!(registry.entries()[0].title, "Rust (programming language)");
        assert_eq!(extract_urls(&format!("({url})")), [url]);
    }

    #[test]
    fn bracketed_numbers_outside_citations_are_kept() {
        let listed = vec![ListedSource {
            id: 1,
            title: "Book".into(),
            url: "https://book.example".into(),
        }];
        let body = "Indexing `v[0]` panics when empty, as does arr[1]. Footnote [3] stays.\n\n\
                    ```rust\nlet x = v[1];\n```\nThe book agrees [1].";

        let (text, registry) = renumber(body, &HashMap::new(), &listed);

        assert_eq!(
            text,
            "Indexing `v[0]` panics when empty, as does arr[1]. Footnote [3] stays.\n\n\
             ```rust\nlet x = v[1];\n```\nThe book agrees [1]."
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries()[0].title, "Book");
    }

    #[test]
    fn file_urls_fall_back_to_file_name() {
        let (text, registry) = renumber("See file:///docs/guide.md.", &HashMap::new(), &[]);
        assert_eq!(text, "See [1].");
        assert_eq!(registry.entries()[0].title, "guide.md");
        assert_eq!(
            extract_urls("a https://x.example/1, [b](https://y.example) https://x.example/1"),
            ["https://x.example/1", "https://y.example"]
        );
    }
}
