use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

use super::state::{EvidenceSet, SearchResult};

/// One level of balanced parentheses is part of the URL, so
/// `https://en.wikipedia.org/wiki/Rust_(programming_language)` matches whole
/// while the closing paren of `(https://a.com)` does not.
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://(?:[^\s<>"'()\[\]{}`]|\([^\s<>"'()\[\]{}`]*\))+"#)
        .expect("valid url regex")
});

static MD_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[([^\]]*)\]\((https?://(?:[^\s()]|\([^\s()]*\))+)\)"#)
        .expect("valid markdown link regex")
});

/// Canonical form used to compare URLs: no scheme, no fragment, no trailing
/// slash, lowercased.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let canonical = match Url::parse(trimmed) {
        Ok(mut url) if url.has_host() => {
            url.set_fragment(None);
            let host = url.host_str().unwrap_or_default();
            let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
            let path = url.path().trim_end_matches('/');
            let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
            format!("{host}{port}{path}{query}")
        }
        _ => {
            let without_scheme = trimmed
                .split_once("://")
                .map(|(_, rest)| rest)
                .unwrap_or(trimmed);
            let without_fragment = without_scheme.split('#').next().unwrap_or_default();
            without_fragment.trim_end_matches('/').to_string()
        }
    };
    canonical.to_lowercase()
}

/// Merge raw hits into an [`EvidenceSet`].
///
/// Input order is rank order. The first occurrence of each normalized URL
/// wins, and at most `cap` entries are kept.
pub fn aggregate(results: Vec<SearchResult>, cap: usize) -> EvidenceSet {
    let mut seen = HashSet::new();
    let items = results
        .into_iter()
        .filter(|result| !result.url.trim().is_empty())
        .filter(|result| seen.insert(normalize_url(&result.url)))
        .take(cap)
        .collect();
    EvidenceSet::from_items(items)
}

/// Interleave per-query result lists by rank so that every query
/// contributes its best hits before any query contributes its second-best.
pub fn interleave_by_rank(per_query: Vec<Vec<SearchResult>>) -> Vec<SearchResult> {
    let mut merged: Vec<(usize, usize, SearchResult)> = per_query
        .into_iter()
        .enumerate()
        .flat_map(|(query_idx, results)| {
            results
                .into_iter()
                .enumerate()
                .map(move |(pos, result)| (pos, query_idx, result))
        })
        .collect();
    merged.sort_by_key(|(pos, query_idx, _)| (*pos, *query_idx));
    merged.into_iter().map(|(_, _, result)| result).collect()
}

/// Render the evidence set as grounding context for the writer prompt.
pub fn format_evidence(evidence: &EvidenceSet, max_chars_per_source: usize) -> String {
    if evidence.is_empty() {
        return "No sources were found.".to_string();
    }

    let mut formatted_text = String::from("Sources:\n\n");
    for (i, source) in evidence.items().iter().enumerate() {
        formatted_text.push_str(&format!("Source [{}] {}:\n===\n", i + 1, source.title));
        formatted_text.push_str(&format!("URL: {}\n===\n", source.url));
        formatted_text.push_str(&format!(
            "Most relevant content from source: {}\n===\n\n",
            truncate_chars(&source.snippet, max_chars_per_source)
        ));
    }
    formatted_text.trim().to_string()
}

pub fn format_sources(evidence: &EvidenceSet) -> String {
    evidence
        .items()
        .iter()
        .map(|source| format!("* {} : {}", source.title, source.url))
        .collect::<Vec<String>>()
        .join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

/// Every http(s) URL mentioned in `text`, in order of appearance.
pub fn cited_urls(text: &str) -> Vec<String> {
    URL_RE
        .find_iter(text)
        .map(|m| trim_trailing_punctuation(m.as_str()).to_string())
        .collect()
}

fn trim_trailing_punctuation(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':', '!', '?', '*'])
}

/// Cited URLs that do not appear in the evidence set.
pub fn ungrounded_urls(text: &str, evidence: &EvidenceSet) -> Vec<String> {
    let allowed: HashSet<String> = evidence.urls().map(normalize_url).collect();
    let mut seen = HashSet::new();
    cited_urls(text)
        .into_iter()
        .filter(|url| !allowed.contains(&normalize_url(url)))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Drop every citation of a URL outside the evidence set. Markdown links
/// keep their label; bare URLs are removed.
pub fn strip_ungrounded_urls(text: &str, evidence: &EvidenceSet) -> String {
    let allowed: HashSet<String> = evidence.urls().map(normalize_url).collect();
    let is_allowed = |url: &str| allowed.contains(&normalize_url(trim_trailing_punctuation(url)));

    let relinked = MD_LINK_RE.replace_all(text, |caps: &regex::Captures| {
        if is_allowed(&caps[2]) {
            caps[0].to_string()
        } else {
            caps[1].to_string()
        }
    });

    URL_RE
        .replace_all(&relinked, |caps: &regex::Captures| {
            let matched = &caps[0];
            let url = trim_trailing_punctuation(matched);
            if is_allowed(url) {
                matched.to_string()
            } else {
                matched[url.len()..].to_string()
            }
        })
        .into_owned()
}

/// Drop the scheme from every URL in `text`, so text copied from user input
/// is never read back as a citation.
pub fn defang_urls(text: &str) -> String {
    URL_RE
        .replace_all(text, |caps: &regex::Captures| {
            caps[0]
                .split_once("://")
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Remove `<think>...</think>` blocks emitted by reasoning models. An
/// unterminated block swallows the rest of the text.
pub fn strip_think_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}
