pub const QUERY_WRITER_INSTRUCTIONS: &str = r#"You are a research assistant tasked with generating effective web search queries.
Your goal is to create up to {max_queries} search queries that together gather the most relevant and recent information about the research topic.
Each query should target a different aspect of the topic.

Research topic: {research_topic}

Format your response as JSON with a single key 'queries' containing a list of search query strings."#;

pub const STRICT_JSON_REMINDER: &str = r#"

IMPORTANT: Your previous answer could not be parsed. Respond with ONLY a JSON object, no prose, no markdown fences, for example:
{"queries": ["first query", "second query"]}"#;

pub const REPORT_WRITER_INSTRUCTIONS: &str = r#"You are a research writer. Write a clear, well-structured research report in Markdown that answers the research topic.

Rules:
- Base every claim on the numbered sources below. Do not rely on memory for facts.
- Cite sources inline with their URL exactly as given, e.g. (https://example.com/page).
- Never cite a URL that is not listed in the sources.
- Note where sources disagree or where evidence is thin.
- Start with a short overview, then key findings under headings, then a brief conclusion.
- Do not add a list of sources at the end; it is appended automatically.

<Research Topic>
{research_topic}
</Research Topic>

<Sources>
{sources}
</Sources>"#;

pub const NO_EVIDENCE_INSTRUCTIONS: &str = r#"You are a research writer. A web search for the research topic below returned no usable sources.

Rules:
- State clearly at the start that no live sources could be found and the answer is based on general knowledge only.
- Be explicit about uncertainty and about what may be outdated.
- Do not cite or invent any URLs.
- Keep the answer concise and structured in Markdown.

<Research Topic>
{research_topic}
</Research Topic>"#;

pub const STRICT_GROUNDING_REMINDER: &str = r#"

IMPORTANT: Your previous answer cited URLs that are not in the sources ({ungrounded}). Rewrite the report citing ONLY the URLs listed in the sources."#;

pub const STRICT_REPORT_REMINDER: &str = r#"

IMPORTANT: Your previous answer was empty or unusable. Respond with the complete report in Markdown, with at least one paragraph of findings. Do not answer with only reasoning or an empty message."#;

pub fn format_query_writer_instructions(research_topic: &str, max_queries: usize) -> String {
    QUERY_WRITER_INSTRUCTIONS
        .replace("{max_queries}", &max_queries.to_string())
        .replace("{research_topic}", research_topic)
}

pub fn format_report_writer_instructions(research_topic: &str, sources: &str) -> String {
    REPORT_WRITER_INSTRUCTIONS
        .replace("{research_topic}", research_topic)
        .replace("{sources}", sources)
}

pub fn format_no_evidence_instructions(research_topic: &str) -> String {
    NO_EVIDENCE_INSTRUCTIONS.replace("{research_topic}", research_topic)
}

pub fn format_strict_grounding_reminder(ungrounded: &[String]) -> String {
    STRICT_GROUNDING_REMINDER.replace("{ungrounded}", &ungrounded.join(", "))
}
