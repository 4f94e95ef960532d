//! Caption builders. Pure functions over a [`RepoSnapshot`]; every value
//! taken from GitHub is HTML-escaped before it reaches the template.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use github_api::{Release, RepoSnapshot};
use regex::Regex;

use crate::utils::text::{escape_html, truncate_chars};

pub const DESCRIPTION_LIMIT: usize = 700;
pub const RELEASE_NOTES_LIMIT: usize = 1000;
const RELEASE_NOTES_KEEP: usize = 897;

static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*_]{3,}\s*$").expect("rule regex"));
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+\.)\s+").expect("list regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#{1,6}\s*(.+?)\s*#*$").expect("heading regex"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold regex"));
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("code regex"));
static IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[?!\[[^\]]*\]\([^)]*\)(?:\]\([^)]*\))?").expect("image regex")
});
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("link regex"));
static BARE_ISSUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|\s)(https://github\.com/[\w.-]+/[\w.-]+/(?:issues|pull)/(\d+))")
        .expect("issue regex")
});
static COMPARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(https://github\.com/\S+/compare/\S+)").expect("compare regex")
});
static QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*&gt;\s?").expect("quote regex"));
static RAW_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][^>]*>").expect("tag regex"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank run regex"));

/// `12345` -> `12.3K`, `2500000` -> `2.5M`.
pub fn abbreviate(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// "3 days ago", "in 2 hours", "just now".
pub fn time_ago(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let future = at > now;
    let secs = (now - at).num_seconds().abs();
    let days = secs / 86_400;

    let unit = match secs {
        s if s < 60 => return if future { "in a moment".into() } else { "just now".into() },
        s if s < 3_600 => plural(s / 60, "minute"),
        s if s < 86_400 => plural(s / 3_600, "hour"),
        _ if days < 365 => plural(days, "day"),
        _ => plural(days / 365, "year"),
    };
    if future {
        format!("in {unit}")
    } else {
        format!("{unit} ago")
    }
}

/// `02.07.25 at 02:20 PM (2 days ago)`.
pub fn release_date(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!("{} ({})", at.format("%d.%m.%y at %I:%M %p"), time_ago(at, now))
}

fn hashtag(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

pub fn repository_preview(snapshot: &RepoSnapshot, summary: Option<&str>) -> String {
    repository_preview_at(snapshot, summary, Utc::now())
}

pub fn repository_preview_at(
    snapshot: &RepoSnapshot,
    summary: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let description = summary
        .filter(|s| !s.trim().is_empty())
        .or(snapshot.description.as_deref().filter(|d| !d.trim().is_empty()))
        .unwrap_or("No description available.");
    let description = escape_html(&truncate_chars(description, DESCRIPTION_LIMIT, "..."));

    let url = escape_html(&snapshot.url);
    let name = escape_html(&snapshot.name_with_owner);

    let release = match snapshot.latest_release() {
        Some(r) => format!(
            "<a href=\"{}\">{}</a>",
            escape_html(&r.url),
            escape_html(&r.tag_name)
        ),
        None => "No official releases".to_string(),
    };

    let updated = match snapshot.pushed_at {
        Some(at) => format!("{} ({})", at.format("%Y-%m-%d"), time_ago(at, now)),
        None => "N/A".to_string(),
    };

    let languages = if snapshot.languages.is_empty() || snapshot.languages_total_size == 0 {
        "Not specified".to_string()
    } else {
        snapshot
            .languages
            .iter()
            .map(|lang| {
                let pct = lang.size as f64 / snapshot.languages_total_size as f64 * 100.0;
                format!("#{} (<code>{pct:.1}%</code>)", escape_html(&hashtag(&lang.name)))
            })
            .collect::<Vec<_>>()
            .join(" ")
    };

    let license = snapshot
        .license
        .as_deref()
        .map(|l| format!("📜 <b>License:</b> {}\n", escape_html(l)))
        .unwrap_or_default();

    let mut message = format!(
        "📦 <a href=\"{url}\">{name}</a>\n\n\
         <blockquote expandable>📝 {description}</blockquote>\n\n\
         ⭐ <b>Stars:</b> <code>{stars}</code> | 🍴 <b>Forks:</b> <code>{forks}</code> | 🪲 Open Issues: <code>{issues}</code>\n\n\
         {license}\n\
         🚀 <b>Latest Release:</b> {release}\n\
         ⏳ <b>Last updated:</b> {updated}\n\
         💻 <b>Langs:</b> {languages}\n\n\
         <a href=\"{url}\">🔗 View on GitHub</a>",
        stars = abbreviate(snapshot.stargazer_count),
        forks = abbreviate(snapshot.fork_count),
        issues = snapshot.open_issues,
    );

    if !snapshot.topics.is_empty() {
        let topics: Vec<String> = snapshot
            .topics
            .iter()
            .map(|t| format!("#{}", escape_html(&hashtag(t))))
            .collect();
        message.push_str("\n\n");
        message.push_str(&topics.join(" "));
    }

    message.trim().to_string()
}

pub fn release_notification(snapshot: &RepoSnapshot, release: &Release) -> String {
    release_notification_at(snapshot, release, Utc::now())
}

pub fn release_notification_at(
    snapshot: &RepoSnapshot,
    release: &Release,
    now: DateTime<Utc>,
) -> String {
    let mut parts = vec![
        format!(
            "🚀 <b>New Release: <a href=\"{}\">{}</a></b>",
            escape_html(&snapshot.url),
            escape_html(&snapshot.name_with_owner)
        ),
        format!("└─ 🔖 <code>{}</code>", escape_html(&release.tag_name)),
    ];

    if let Some(published) = release.published_at {
        parts.push(format!("└─ 🗓️ Published: {}", release_date(published, now)));
    }

    if let Some(raw) = release.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let shortened = if raw.chars().count() > RELEASE_NOTES_LIMIT {
            format!("{}...", raw.chars().take(RELEASE_NOTES_KEEP).collect::<String>())
        } else {
            raw.to_string()
        };
        let notes = clean_release_notes(&shortened);
        if !notes.is_empty() {
            parts.push(format!(
                "\n<blockquote expandable>📝 <b>Release Notes:</b>\n{notes}</blockquote>"
            ));
        }
    }

    parts.push(format!("\n#NewRelease - #Releases{}", release_hashtag(snapshot.name())));
    parts.join("\n")
}

/// `my-cool.lib` -> `My_coollib`.
fn release_hashtag(name: &str) -> String {
    let cleaned: String = name.replace('-', "_").replace('.', "");
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Convert GitHub release Markdown into Telegram HTML.
///
/// Raw HTML in the input is stripped and the rest escaped, so the only tags
/// in the output are the ones produced here.
pub fn clean_release_notes(markdown: &str) -> String {
    let text = markdown.replace("\r\n", "\n").replace('\r', "\n");
    let text = RAW_TAG.replace_all(&text, "");

    let mut lines = Vec::new();
    for line in text.trim().lines() {
        let line = line.trim();
        if HORIZONTAL_RULE.is_match(line) {
            continue;
        }
        if line.is_empty() {
            lines.push(String::new());
            continue;
        }

        let mut line = escape_html(line);
        let mut marker = "";
        if let Some(m) = LIST_MARKER.find(&line) {
            marker = "• ";
            line = line[m.end()..].to_string();
        }

        line = HEADING.replace(&line, "<b>$1</b>").into_owned();
        line = IMAGE.replace_all(&line, "").into_owned();
        line = BARE_ISSUE
            .replace_all(&line, r#"$1<a href="$2">#$3</a>"#)
            .into_owned();
        line = CODE.replace_all(&line, "<code>$1</code>").into_owned();
        line = BOLD.replace_all(&line, "<b>$1</b>").into_owned();
        line = LINK.replace_all(&line, r#"<a href="$2">$1</a>"#).into_owned();
        line = QUOTE.replace(&line, "").into_owned();

        if line.to_ascii_lowercase().contains("full changelog") {
            line = COMPARE
                .replace_all(&line, r#"<a href="$1">View Full Changelog</a>"#)
                .into_owned();
            line = format!("📄 <b>{line}</b>");
        }

        let line = format!("{marker}{line}");
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }

    BLANK_RUNS
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}
