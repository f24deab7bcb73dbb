//! Session transcript export.
//!
//! Renders the full message log as markdown: role-labeled turns plus
//! citation footnotes. Served by the HTTP layer as a `text/markdown`
//! attachment.

use crate::models::StoredMessage;

/// Render a session's ordered messages as a markdown transcript.
pub fn render_transcript(messages: &[StoredMessage]) -> String {
    let mut lines = vec!["# Chat Export\n".to_string()];

    for msg in messages {
        let role = if msg.username == "assistant" {
            "Assistant"
        } else {
            "User"
        };
        lines.push(format!("## {}\n\n{}\n", role, msg.message));

        if !msg.sources.is_empty() {
            lines.push("**Sources:**\n".to_string());
            for s in &msg.sources {
                let page_info = match s.page {
                    Some(p) => format!(" (page {})", p),
                    None => String::new(),
                };
                let snippet: String = s.snippet.chars().take(100).collect();
                lines.push(format!("- {}{}: {}...\n", s.filename, page_info, snippet));
            }
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceCitation;

    fn msg(seqno: i64, username: &str, text: &str, sources: Vec<SourceCitation>) -> StoredMessage {
        StoredMessage {
            seqno,
            session_id: "s1".to_string(),
            username: username.to_string(),
            message: text.to_string(),
            sources,
        }
    }

    #[test]
    fn test_transcript_roles_and_order() {
        let messages = vec![
            msg(0, "user", "What is X?", vec![]),
            msg(1, "assistant", "X is a thing.", vec![]),
        ];
        let out = render_transcript(&messages);
        assert!(out.starts_with("# Chat Export"));
        let user_pos = out.find("## User").unwrap();
        let assistant_pos = out.find("## Assistant").unwrap();
        assert!(user_pos < assistant_pos);
        assert!(out.contains("What is X?"));
        assert!(out.contains("X is a thing."));
    }

    #[test]
    fn test_transcript_citation_footnotes() {
        let sources = vec![
            SourceCitation {
                filename: "report.pdf".to_string(),
                page: Some(3),
                snippet: "relevant passage".to_string(),
            },
            SourceCitation {
                filename: "notes.txt".to_string(),
                page: None,
                snippet: "y".repeat(300),
            },
        ];
        let out = render_transcript(&[msg(0, "assistant", "Answer.", sources)]);
        assert!(out.contains("**Sources:**"));
        assert!(out.contains("- report.pdf (page 3): relevant passage..."));
        // Page omitted when unknown, snippet capped at 100 chars.
        assert!(out.contains(&format!("- notes.txt: {}...", "y".repeat(100))));
        assert!(!out.contains(&"y".repeat(101)));
    }
}
