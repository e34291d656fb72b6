//! Plain-text rendering of reminder notifications.

use super::model::{Attachment, AttachmentKind};

/// Maximum length of an article excerpt in the message body.
pub const MAX_EXCERPT_LENGTH: usize = 100;

/// Values needed to render one reminder message.
#[derive(Debug, Clone)]
pub struct ReminderMessage<'a> {
    pub patient_name: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub attachments: &'a [Attachment],
    /// Disclaimer footer; `None` when disabled.
    pub disclaimer: Option<&'a str>,
}

impl ReminderMessage<'_> {
    /// Render the message text sent to the recipient.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!("Halo {},\n\n", self.patient_name));
        out.push_str(&format!("*{}*\n\n", self.title));

        if !self.description.is_empty() {
            out.push_str(self.description);
            out.push_str("\n\n");
        }

        if !self.attachments.is_empty() {
            out.push_str("---\n");
            out.push_str("Konten Edukasi:\n");

            let articles = self
                .attachments
                .iter()
                .filter(|a| a.kind == AttachmentKind::Article);
            let videos = self
                .attachments
                .iter()
                .filter(|a| a.kind == AttachmentKind::Video);

            for attachment in articles.chain(videos) {
                render_attachment(&mut out, attachment);
                out.push('\n');
            }
        }

        if let Some(disclaimer) = self.disclaimer.filter(|d| !d.is_empty()) {
            out.push_str("---\n");
            out.push_str(&format!("_{disclaimer}_"));
        }

        out
    }
}

fn render_attachment(out: &mut String, attachment: &Attachment) {
    match attachment.kind {
        AttachmentKind::Article => {
            out.push_str(&format!("📖 {}\n", attachment.title));
            let excerpt = attachment
                .excerpt
                .as_deref()
                .filter(|e| !e.is_empty())
                .unwrap_or(&attachment.title);
            out.push_str(&truncate_excerpt(excerpt, MAX_EXCERPT_LENGTH));
            out.push('\n');
        }
        AttachmentKind::Video => {
            out.push_str(&format!("🎬 {}\n", attachment.title));
        }
    }
    if let Some(url) = attachment.url.as_deref().filter(|u| !u.is_empty()) {
        out.push_str(&format!("🔗 {url}\n"));
    }
}

/// Truncate to `max` characters, preferring a word boundary, and append `...`.
pub fn truncate_excerpt(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }

    let cut: String = text.chars().take(max).collect();
    let trimmed = cut.trim_end_matches(' ');
    match trimmed.rfind(' ') {
        Some(idx) if trimmed[..idx].chars().count() > max / 2 => {
            format!("{}...", trimmed[..idx].trim_end_matches(' '))
        }
        _ => format!("{trimmed}..."),
    }
}
