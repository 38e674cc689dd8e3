use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::{context, Environment};
use uuid::Uuid;

use crate::config::SmtpSettings;
use crate::models::FacultyProfile;

const EMAIL_BODY: &str = "Hello,\n\nAttached are your latest personalized funding \
opportunity matches, generated from the research profile you submitted. Open the \
attached HTML file to browse the opportunities.\n\nICC Proposal-Enabled AI Support \
Initiative\nInstitute of Computing and Cybersystems\n";

const DIGEST_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>RFP Opportunities for {{ email }} - {{ date }}</title>
    <style>
        body { font-family: 'Segoe UI', Tahoma, sans-serif; margin: 30px; color: #333; }
        h1 { color: #2c3e50; border-bottom: 3px solid #3498db; padding-bottom: 10px; }
        .summary { background-color: #e8f4fd; padding: 15px; border-radius: 5px;
                   border-left: 4px solid #3498db; margin-bottom: 25px; }
        table { border-collapse: collapse; width: 100%; font-size: 14px; }
        th { background-color: #34495e; color: white; padding: 12px 8px; text-align: left; }
        td { border: 1px solid #ddd; padding: 10px 8px; vertical-align: top; }
        tr:nth-child(even) { background-color: #f8f9fa; }
        .footer { margin-top: 30px; color: #666; font-size: 12px; text-align: center; }
    </style>
</head>
<body>
    <h1>RFP Opportunities for {{ email }}</h1>
    <div class="summary">
        <strong>Summary:</strong> {{ opportunity_count }} funding opportunities found<br>
        <strong>Generated:</strong> {{ date }}
    </div>
    {{ table_html }}
    <div class="footer">
        <p><em>Generated by the ICC Proposal-Enabled AI Support Initiative<br>
        Institute of Computing and Cybersystems</em></p>
    </div>
</body>
</html>
"#;

/// Upstream send failure, or a failure preparing the digest for sending.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to write digest artifacts: {0}")]
    Artifacts(#[from] std::io::Error),

    #[error("template rendering failed: {0}")]
    Template(#[from] minijinja::Error),

    #[error("invalid mailbox address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("smtp delivery failed: {0}")]
    Smtp(String),
}

/// Paths of the per-faculty digest artifacts, recorded in the ledger on both
/// success and failure. All fields are best effort.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPaths {
    pub markdown: Option<PathBuf>,
    pub html: Option<PathBuf>,
    pub folder: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub artifacts: ArtifactPaths,
}

/// A failed delivery still reports whatever artifacts made it to disk.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub error: DeliveryError,
    pub artifacts: ArtifactPaths,
}

/// The delivery collaborator: digest text in, message id out, with the side
/// effect of writing two rendered files to the faculty member's folder.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(
        &self,
        profile: &FacultyProfile,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryFailure>;
}

/// Remove a `<think>` block if the generation model emitted one.
fn strip_think(content: &str) -> &str {
    if content.contains("<think>") {
        if let Some((_, rest)) = content.rsplit_once("</think>") {
            return rest;
        }
    }
    content
}

const TABLE_HEADER_KEYWORDS: [&str; 4] = ["Funding Agency", "Program Name", "Agency", "Deadline"];

/// Pull the opportunity table out of the generated markdown, if one exists.
fn extract_table(content: &str) -> Option<String> {
    let mut table_lines: Vec<&str> = Vec::new();
    let mut in_table = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if !in_table
            && trimmed.starts_with('|')
            && TABLE_HEADER_KEYWORDS.iter().any(|kw| line.contains(kw))
        {
            in_table = true;
            table_lines.push(line);
        } else if in_table && trimmed.starts_with('|') {
            table_lines.push(line);
        } else if in_table && trimmed.is_empty() {
            continue;
        } else if in_table {
            break;
        }
    }

    if table_lines.is_empty() {
        None
    } else {
        Some(table_lines.join("\n"))
    }
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty()
        && cells.iter().all(|cell| {
            !cell.is_empty() && cell.chars().all(|c| c == '-' || c == ':' || c == ' ')
        })
}

fn split_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Number of data rows in an extracted markdown table.
fn count_opportunities(table_markdown: &str) -> usize {
    table_markdown
        .lines()
        .skip(1)
        .map(split_row)
        .filter(|cells| !is_separator_row(cells))
        .count()
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Convert a markdown pipe table into an HTML table.
fn table_to_html(table_markdown: &str) -> String {
    let mut rows = table_markdown.lines().map(split_row);
    let Some(header) = rows.next() else {
        return String::new();
    };

    let mut html = String::from("<table>\n<thead>\n<tr>");
    for cell in &header {
        html.push_str(&format!("<th>{}</th>", escape_html(cell)));
    }
    html.push_str("</tr>\n</thead>\n<tbody>\n");
    for cells in rows {
        if is_separator_row(&cells) {
            continue;
        }
        html.push_str("<tr>");
        for cell in &cells {
            html.push_str(&format!("<td>{}</td>", escape_html(cell)));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>");
    html
}

struct RenderedDigest {
    html: String,
}

/// Write the raw markdown and the rendered HTML page into the faculty
/// member's folder, filling `artifacts` as each file lands so a later
/// failure still reports the paths written so far.
fn write_digest_artifacts(
    root: &Path,
    email: &str,
    content: &str,
    date: chrono::NaiveDate,
    artifacts: &mut ArtifactPaths,
) -> Result<RenderedDigest, DeliveryError> {
    let username = email.split('@').next().unwrap_or(email);
    let folder = root.join(username);
    std::fs::create_dir_all(&folder)?;
    artifacts.folder = Some(folder.clone());

    let markdown_path = folder.join(format!("{username}_{date}.md"));
    std::fs::write(&markdown_path, content)?;
    artifacts.markdown = Some(markdown_path);

    let body = strip_think(content);
    let table_markdown = match extract_table(body) {
        Some(table) => table,
        None => {
            tracing::warn!(email, "no opportunity table found in digest, using full content");
            body.to_string()
        }
    };

    let env = Environment::new();
    let template = env.template_from_str(DIGEST_PAGE_TEMPLATE)?;
    let html = template.render(context! {
        email => email,
        date => date.to_string(),
        opportunity_count => count_opportunities(&table_markdown),
        table_html => table_to_html(&table_markdown),
    })?;

    let html_path = folder.join(format!("{username}_{date}.html"));
    std::fs::write(&html_path, &html)?;
    artifacts.html = Some(html_path);

    Ok(RenderedDigest { html })
}

/// Production deliverer: digest artifacts on disk, then SMTP via lettre.
pub struct SmtpDeliverer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    cc: Vec<Mailbox>,
    digest_dir: PathBuf,
}

impl SmtpDeliverer {
    /// Build from SMTP settings. Credentials are resolved from the
    /// `SMTP_USERNAME` and `SMTP_PASSWORD` environment variables; without
    /// both, the connection is unauthenticated.
    pub fn from_settings(smtp: &SmtpSettings, digest_dir: &Path) -> anyhow::Result<Self> {
        if smtp.sender.trim().is_empty() {
            anyhow::bail!("SENDER_EMAIL is not configured");
        }
        let sender: Mailbox = smtp
            .sender
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid SENDER_EMAIL {:?}: {e}", smtp.sender))?;
        let cc = smtp
            .cc_recipients
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| anyhow::anyhow!("invalid CC recipient {addr:?}: {e}"))
            })
            .collect::<anyhow::Result<Vec<Mailbox>>>()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?
            .port(smtp.port);
        if let (Ok(username), Ok(password)) =
            (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            sender,
            cc,
            digest_dir: digest_dir.to_path_buf(),
        })
    }

    fn build_message(
        &self,
        profile: &FacultyProfile,
        html: String,
        date: chrono::NaiveDate,
    ) -> Result<(Message, String), DeliveryError> {
        let to: Mailbox = profile.email.parse()?;
        let username = profile.email.split('@').next().unwrap_or(&profile.email);
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.sender.email.domain());

        let mut builder = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .message_id(Some(message_id.clone()))
            .subject(format!("ICC AI-Enabled RFP Results for {username}, {date}"));
        for cc in &self.cc {
            builder = builder.cc(cc.clone());
        }

        let attachment = Attachment::new(format!("{username}_{date}.html"))
            .body(html, ContentType::TEXT_HTML);
        let message = builder.multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(EMAIL_BODY.to_string()))
                .singlepart(attachment),
        )?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl Deliverer for SmtpDeliverer {
    async fn deliver(
        &self,
        profile: &FacultyProfile,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryFailure> {
        let date = Utc::now().date_naive();
        let mut artifacts = ArtifactPaths::default();

        let rendered = match write_digest_artifacts(
            &self.digest_dir,
            &profile.email,
            content,
            date,
            &mut artifacts,
        ) {
            Ok(rendered) => rendered,
            Err(error) => return Err(DeliveryFailure { error, artifacts }),
        };

        let (message, message_id) = match self.build_message(profile, rendered.html, date) {
            Ok(message) => message,
            Err(error) => return Err(DeliveryFailure { error, artifacts }),
        };

        match self.transport.send(message).await {
            Ok(_) => {
                tracing::info!(
                    email = %profile.email,
                    message_id = %message_id,
                    "digest email delivered"
                );
                Ok(DeliveryReceipt {
                    message_id,
                    artifacts,
                })
            }
            Err(error) => Err(DeliveryFailure {
                error: DeliveryError::Smtp(error.to_string()),
                artifacts,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const DIGEST: &str = "Here are your matches.\n\n\
| Funding Agency | Program Name | Deadline | Award Amount | Link |\n\
|---|---|---|---|---|\n\
| NSF | CAREER | 2026-07-22 | $500,000 | https://nsf.gov/career |\n\
| DOE | Early Career | 2026-09-01 | $875,000 | https://energy.gov/ec |\n\n\
Good luck with your proposals.";

    #[test]
    fn extracts_the_opportunity_table() {
        let table = extract_table(DIGEST).unwrap();
        assert!(table.starts_with("| Funding Agency"));
        assert_eq!(table.lines().count(), 4);
        assert!(!table.contains("Good luck"));
    }

    #[test]
    fn extract_returns_none_without_a_table() {
        assert!(extract_table("no opportunities found this week").is_none());
        // A pipe table without any recognized header keyword is not counted.
        assert!(extract_table("| a | b |\n|---|---|\n| 1 | 2 |").is_none());
    }

    #[test]
    fn strip_think_removes_reasoning_block() {
        let content = "<think>internal reasoning</think>\nreal digest";
        assert_eq!(strip_think(content).trim(), "real digest");
        assert_eq!(strip_think("plain digest"), "plain digest");
    }

    #[test]
    fn counts_data_rows_excluding_header_and_separator() {
        let table = extract_table(DIGEST).unwrap();
        assert_eq!(count_opportunities(&table), 2);
    }

    #[test]
    fn table_html_has_header_and_escaped_cells() {
        let html = table_to_html("| Agency | Note |\n|---|---|\n| NSF | a < b |");
        assert!(html.contains("<th>Agency</th>"));
        assert!(html.contains("<td>a &lt; b</td>"));
        assert!(!html.contains("|---|"));
    }

    #[test]
    fn artifacts_are_written_into_the_faculty_folder() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let mut artifacts = ArtifactPaths::default();

        let rendered =
            write_digest_artifacts(dir.path(), "avery.lee@mtu.edu", DIGEST, date, &mut artifacts)
                .unwrap();

        let folder = artifacts.folder.unwrap();
        assert!(folder.ends_with("avery.lee"));
        let markdown = artifacts.markdown.unwrap();
        assert!(markdown.ends_with("avery.lee_2026-03-14.md"));
        assert_eq!(std::fs::read_to_string(&markdown).unwrap(), DIGEST);

        let html = std::fs::read_to_string(artifacts.html.unwrap()).unwrap();
        assert_eq!(rendered.html, html);
        assert!(html.contains("2 funding opportunities found"));
        assert!(html.contains("<td>NSF</td>"));
    }

    #[test]
    fn full_content_is_the_fallback_when_no_table_exists() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let mut artifacts = ArtifactPaths::default();

        write_digest_artifacts(
            dir.path(),
            "a@x.edu",
            "nothing matched this cycle",
            date,
            &mut artifacts,
        )
        .unwrap();

        let html = std::fs::read_to_string(artifacts.html.unwrap()).unwrap();
        assert!(html.contains("nothing matched this cycle"));
    }

    #[test]
    fn from_settings_requires_a_sender() {
        let smtp = SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            sender: String::new(),
            cc_recipients: Vec::new(),
        };
        assert!(SmtpDeliverer::from_settings(&smtp, Path::new("digests")).is_err());
    }

    #[test]
    fn from_settings_validates_cc_recipients() {
        let smtp = SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            sender: "rfp@mtu.edu".to_string(),
            cc_recipients: vec!["not-an-address".to_string()],
        };
        assert!(SmtpDeliverer::from_settings(&smtp, Path::new("digests")).is_err());

        let smtp = SmtpSettings {
            cc_recipients: vec!["admin@mtu.edu".to_string()],
            ..smtp
        };
        assert!(SmtpDeliverer::from_settings(&smtp, Path::new("digests")).is_ok());
    }
}
