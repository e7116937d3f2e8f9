//! Canned replies keyed on message keywords.

use super::{ChatBackend, ChatError, ChatRequest, ChatResponse, SuggestedAction};
use async_trait::async_trait;
use serde_json::json;

/// Civic topics the canned replies know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Status,
    Pothole,
    Streetlight,
    Sanitation,
    Graffiti,
    Water,
    Greeting,
}

impl Topic {
    /// Checked in this order; the first topic with a matching keyword wins.
    pub const ALL: &'static [Topic] = &[
        Topic::Status,
        Topic::Pothole,
        Topic::Streetlight,
        Topic::Sanitation,
        Topic::Graffiti,
        Topic::Water,
        Topic::Greeting,
    ];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Topic::Status => "status",
            Topic::Pothole => "pothole",
            Topic::Streetlight => "streetlight",
            Topic::Sanitation => "sanitation",
            Topic::Graffiti => "graffiti",
            Topic::Water => "water",
            Topic::Greeting => "greeting",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Topic::Status => &["status", "track", "update", "progress"],
            Topic::Pothole => &["pothole", "potholes", "road", "asphalt"],
            Topic::Streetlight => &["streetlight", "streetlights", "lamp", "light", "lights"],
            Topic::Sanitation => &["trash", "garbage", "sanitation", "recycling", "litter", "dumping"],
            Topic::Graffiti => &["graffiti", "vandalism", "tag", "tagged"],
            Topic::Water => &["water", "leak", "leaking", "flood", "flooding", "hydrant", "sewer"],
            Topic::Greeting => &["hello", "hi", "hey", "greetings"],
        }
    }

    /// First topic whose keywords appear as words in `message`.
    #[must_use]
    pub fn detect(message: &str) -> Option<Topic> {
        let lowered = message.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        Topic::ALL
            .iter()
            .copied()
            .find(|topic| topic.keywords().iter().any(|k| words.contains(k)))
    }

    fn reply(self) -> &'static str {
        match self {
            Topic::Status => {
                "I can look up an existing report. Please share your issue number \
                 and I'll tell you where it stands."
            }
            Topic::Pothole => {
                "Sorry about the pothole. Tell me the nearest address or intersection \
                 and, if you can, attach a photo so a crew can assess it."
            }
            Topic::Streetlight => {
                "Thanks for flagging the streetlight. The pole number on the light \
                 helps us find it fastest; otherwise the nearest address works."
            }
            Topic::Sanitation => {
                "I can log a sanitation request. Is this a missed pickup, illegal \
                 dumping, or overflowing bins?"
            }
            Topic::Graffiti => {
                "Graffiti reports go to our cleanup team. Where is it, and is it on \
                 public or private property?"
            }
            Topic::Water => {
                "If water is actively flooding the street, please call the emergency \
                 line. Otherwise give me the location and I'll file a report."
            }
            Topic::Greeting => {
                "Hello! I can help you report a civic issue or check on an existing \
                 report. What can I do for you?"
            }
        }
    }

    /// Buttons offered alongside a reply on this topic.
    #[must_use]
    pub fn suggested_actions(self) -> Vec<SuggestedAction> {
        match self {
            Topic::Status => vec![
                SuggestedAction::new("Check issue status", "check_status", json!(null)),
                SuggestedAction::new("View my reports", "list_reports", json!(null)),
            ],
            Topic::Greeting => vec![
                SuggestedAction::new("Report an issue", "report_issue", json!(null)),
                SuggestedAction::new("Check issue status", "check_status", json!(null)),
            ],
            topic => vec![
                SuggestedAction::new(
                    "Report this issue",
                    "report_issue",
                    json!({ "category": topic.id() }),
                ),
                SuggestedAction::new(
                    "Attach a photo",
                    "upload_photo",
                    json!({ "category": topic.id() }),
                ),
            ],
        }
    }
}

const DEFAULT_REPLY: &str = "I can help with potholes, streetlights, sanitation, graffiti \
     and water problems, or check on a report you've already filed. What's going on?";

/// Offline backend answering from a fixed lookup table.
#[derive(Debug, Clone, Default)]
pub struct MockBackend;

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Reply without going through the async trait.
    #[must_use]
    pub fn respond(&self, message: &str) -> ChatResponse {
        match Topic::detect(message) {
            Some(topic) => ChatResponse {
                response: topic.reply().to_string(),
                suggested_actions: topic.suggested_actions(),
                context_updates: json!({ "last_topic": topic.id() }),
            },
            None => ChatResponse {
                response: DEFAULT_REPLY.to_string(),
                suggested_actions: Topic::Greeting.suggested_actions(),
                context_updates: json!({}),
            },
        }
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn reply(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        request.validate()?;
        Ok(self.respond(&request.message))
    }
}
