//! Prompt templates for every model-facing stage.
//!
//! Templates are plain English; output language is controlled by an explicit
//! instruction where it matters (the final report).

use crate::language::Language;

pub fn today() -> String {
    chrono::Local::now().format("%A, %B %-d, %Y").to_string()
}

pub fn clarify_system(transcript: &str, already_asked: bool) -> String {
    let asked_note = if already_asked {
        "\nA clarifying question has already been asked in this conversation. Do not ask another one: \
         set \"need_clarification\" to false and confirm that research will start.\n"
    } else {
        ""
    };
    format!(
        r#"These are the messages exchanged so far with a user who asked for a research report:
<Messages>
{transcript}
</Messages>

Today's date is {date}.
{asked_note}
Decide whether you must ask the user a clarifying question or whether there is enough information to start researching.
Ask only when something essential is ambiguous: unknown acronyms, abbreviations, or terms, or a scope that cannot be inferred.
If you ask, be concise, collect everything you need in a single question, use markdown lists where that helps, and never ask for information the user already gave.

Respond with a single JSON object with exactly these keys:
"need_clarification": boolean,
"question": "<question for the user, or empty>",
"verification": "<message confirming that research will start, or empty>"

When asking: need_clarification=true, a non-empty question, and an empty verification.
When not asking: need_clarification=false, an empty question, and a verification that briefly restates the key aspects of the request and confirms research is starting."#,
        date = today(),
    )
}

pub fn brief_system(transcript: &str) -> String {
    format!(
        r#"You will be given the messages exchanged so far between you and a user.
Turn them into one detailed, specific research question that will guide the research.

<Messages>
{transcript}
</Messages>

Today's date is {date}.

Return a JSON object with a single field "research_brief" holding the research question.

Guidelines:
1. Be as specific and detailed as possible. Include every preference and constraint the user stated and list the key dimensions to examine.
2. Dimensions that matter but were left unspecified must be stated as open-ended, with no particular constraint.
3. Do not invent details the user did not give.
4. Write in the first person, from the user's point of view.
5. If specific sources should be preferred, name them. Prefer primary sources: official sites, original papers, manufacturer pages. If the request is in a particular language, prefer sources in that language."#,
        date = today(),
    )
}

pub fn supervisor_system(max_units: usize, max_iterations: usize) -> String {
    format!(
        r#"You are a research supervisor. Your job is to plan research on the user's research brief by delegating it to researcher agents. Today's date is {date}.

On each turn respond with exactly one JSON object choosing one action:
- {{"action": "reflect", "reflection": "<your assessment and plan>"}}: think about what is covered and what is missing. Never reflect twice in a row.
- {{"action": "conduct_research", "topics": ["<instruction>", ...]}}: start one delegation round. Each topic is a complete, standalone instruction for one researcher, who cannot see the other researchers' work. Topics must not overlap. Do not use acronyms or abbreviations.
- {{"action": "research_complete"}}: you have enough findings for a thorough report.

Hard limits:
- At most {max_units} topics per round.
- At most {max_iterations} delegation rounds in total.
- Prefer a single researcher unless the request clearly splits into independent parts. A comparison of several items gets one researcher per item.
- Stop as soon as the findings can support a detailed, well-cited report."#,
        date = today(),
    )
}

pub fn supervisor_brief(brief: &str) -> String {
    format!("Research brief:\n{brief}")
}

pub fn researcher_system(tools: &str, instructions: Option<&str>, max_calls: usize) -> String {
    let extra = instructions
        .map(|text| format!("\n<Tool Instructions>\n{text}\n</Tool Instructions>\n"))
        .unwrap_or_default();
    format!(
        r#"You are a research assistant gathering information on a single topic. Today's date is {date}.

<Available Tools>
{tools}
</Available Tools>
{extra}
Respond on every turn with exactly one JSON object choosing one action:
- {{"action": "use_tools", "calls": [{{"tool": "<name>", "args": {{...}}}}]}}: call one or more tools in parallel.
- {{"action": "reflect", "reflection": "<what you found, what is missing, what to do next>"}}: required after every tool step.
- {{"action": "finish"}}: you can answer the topic comprehensively.

Start broad and narrow down. After every tool step, reflect before calling tools again.
You may issue at most {max_calls} tool calls in total. Stop when you have three or more relevant sources or when your last two searches returned similar information."#,
        date = today(),
    )
}

pub fn researcher_topic(topic: &str) -> String {
    format!("Research topic:\n{topic}")
}

pub fn compress_system() -> String {
    format!(
        r#"You are a research assistant who has gathered information on a topic through tool calls. Clean up the findings without losing anything. Today's date is {date}.

Repeat every relevant fact verbatim in a cleaner format; only remove information that is plainly irrelevant or duplicated. If several sources state the same thing, say so once and cite all of them.
Cite every source inline and end with a `### Sources` list that numbers each url once, without gaps:
[1] Source Title: URL
[2] Source Title: URL

Structure:
**Queries and tool calls made**
**Comprehensive findings**
**All relevant sources**

Do not summarize and do not paraphrase. Every source the researcher found must appear in your output."#,
        date = today(),
    )
}

pub fn compress_request(topic: &str, transcript: &str) -> String {
    format!(
        "Topic: {topic}\n\nThe messages below are a researcher's raw transcript. Clean up the findings; \
         keep all information and every source.\n\n<Transcript>\n{transcript}\n</Transcript>"
    )
}

pub fn report_system(language: Language, min_section_words: usize) -> String {
    let density = if min_section_words == 0 {
        String::from("Sections should be substantive.")
    } else if language.is_cjk() {
        format!("Every ## section must contain at least {min_section_words} characters of prose.")
    } else {
        format!("Every ## section must contain at least {min_section_words} words of prose.")
    };
    format!(
        r#"You write long-form research reports. Today's date is {date}.

Write the entire report in {language}, including every heading, even when the brief or the findings are in another language.

Structure:
- Start with a single `# ` title, use `## ` for sections, `### ` for subsections and `#### ` for detailed points.
- Pick the structure that fits the question. A comparison: introduction, one section per item, a comparison section, conclusion. A list request: the list itself, or one section per item. An overview: overview, one section per concept, conclusion. A single section is fine when it answers the question.
- {density}
- Include concrete facts, figures and examples from the findings and explain them.

Citations:
- Cite sources inline as markdown links in the form [Source Title](URL), using only urls that appear in the findings.
- Do not write a sources or references list; it is generated for you.

Never refer to yourself or to the writing of the report. Do not say what the report will do; just write it."#,
        date = today(),
        language = language.name(),
    )
}

pub fn report_request(brief: &str, transcript: &str, findings: &str) -> String {
    format!(
        "<Research Brief>\n{brief}\n</Research Brief>\n\n\
         <Messages>\n{transcript}\n</Messages>\n\
         Focus on the research brief; when the brief and the messages disagree, follow the brief.\n\n\
         <Findings>\n{findings}\n</Findings>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_prompt_names_language_and_density() {
        let prompt = report_system(Language::Chinese, 300);
        assert!(prompt.contains("Chinese"));
        assert!(prompt.contains("300 characters"));
        assert!(report_system(Language::English, 0).contains("substantive"));
    }

    #[test]
    fn heading_markers_survive_in_prompts() {
        assert!(compress_system().contains("end with a `### Sources` list"));
        let report = report_system(Language::French, 0);
        assert!(report.contains("`#### ` for detailed points"));
        assert!(report.trim_end().ends_with("just write it."));
    }

    #[test]
    fn researcher_prompt_carries_tool_instructions() {
        let prompt = researcher_system("- `read_file`: Read a file.", Some("Prefer local docs."), 4);
        assert!(prompt.contains("read_file"));
        assert!(prompt.contains("<Tool Instructions>\nPrefer local docs."));
        assert!(prompt.contains("at most 4 tool calls"));
    }
}
