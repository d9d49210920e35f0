use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Queued,
    InProgress,
    Closed,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Queued => "queued",
            ContactStatus::InProgress => "in_progress",
            ContactStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> ContactStatus {
        match value {
            "in_progress" => ContactStatus::InProgress,
            "closed" => ContactStatus::Closed,
            _ => ContactStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Customer,
    Company,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Customer => "customer",
            Sender::Company => "company",
        }
    }

    pub fn parse(value: &str) -> Sender {
        if value == "company" {
            Sender::Company
        } else {
            Sender::Customer
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    Text,
    Image,
    Audio,
    Document,
    Template,
}

impl SendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendKind::Text => "text",
            SendKind::Image => "image",
            SendKind::Audio => "audio",
            SendKind::Document => "document",
            SendKind::Template => "template",
        }
    }

    pub fn parse(value: &str) -> SendKind {
        match value {
            "image" => SendKind::Image,
            "audio" => SendKind::Audio,
            "document" => SendKind::Document,
            "template" => SendKind::Template,
            _ => SendKind::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    pub active: bool,
    pub send_blocked: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub customer_code: String,
    pub tax_id: String,
    pub notes: String,
    pub status: ContactStatus,
    pub owner_agent_id: Option<String>,
    pub last_interaction_at: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub contact_id: String,
    pub sender: Sender,
    pub body: Option<String>,
    pub kind: SendKind,
    pub media_id: Option<String>,
    pub cost: f64,
    pub sent_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickReply {
    pub id: String,
    pub title: String,
    pub body: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTemplate {
    pub id: String,
    pub name: String,
    pub language_code: String,
    pub cost: f64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchContactBody {
    pub name: Option<String>,
    pub customer_code: Option<String>,
    pub tax_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub kind: Option<SendKind>,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub parameters: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastBody {
    pub numbers: String,
    pub template_name: String,
    #[serde(default)]
    pub parameters: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserBody {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchUserBody {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
    pub send_blocked: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuickReplyBody {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchQuickReplyBody {
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateBody {
    pub name: String,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTemplateBody {
    pub name: Option<String>,
    pub language_code: Option<String>,
    pub cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutWelcomeMessageBody {
    pub welcome_message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCostReport {
    pub agent_id: String,
    pub agent_name: String,
    pub message_count: i64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ContactStatus::Queued,
            ContactStatus::InProgress,
            ContactStatus::Closed,
        ] {
            assert_eq!(ContactStatus::parse(status.as_str()), status);
        }
        assert_eq!(ContactStatus::parse("garbage"), ContactStatus::Queued);
    }

    #[test]
    fn send_kind_defaults_to_text() {
        assert_eq!(SendKind::parse("template"), SendKind::Template);
        assert_eq!(SendKind::parse(""), SendKind::Text);
    }
}
