use std::collections::HashSet;

use axum::body::Bytes;
use regex::Regex;
use serde_json::{json, Value};

use crate::types::{MessageTemplate, SendKind};

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v21.0";

const COUNTRY_PREFIX: &str = "55";

/// Strips everything but digits. Numbers that come in as 13 digits with the
/// country prefix carry the extra mobile ninth digit, which the provider's
/// numbering still rejects; the digit at position 5 is dropped.
pub fn normalize_phone(raw: &str) -> String {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.len() == 13 && digits.starts_with(COUNTRY_PREFIX) {
        let mut trimmed = String::with_capacity(12);
        trimmed.push_str(&digits[..4]);
        trimmed.push_str(&digits[5..]);
        return trimmed;
    }
    digits
}

/// Splits a raw broadcast list on commas and newlines, keeps tokens with at
/// least 10 digits, prefixes bare national numbers with the country code and
/// deduplicates the result.
pub fn parse_broadcast_numbers(raw: &str) -> Vec<String> {
    let Ok(separator) = Regex::new(r"[,\r\n]+") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut numbers = Vec::new();
    for token in separator.split(raw) {
        let digits = token
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>();
        if digits.len() < 10 {
            continue;
        }
        let candidate = if digits.len() == 10 || digits.len() == 11 {
            format!("{COUNTRY_PREFIX}{digits}")
        } else {
            digits
        };
        if seen.insert(candidate.clone()) {
            numbers.push(candidate);
        }
    }
    numbers
}

/// A template send always logs the template's registered cost estimate; every
/// other kind is free within the messaging session window.
pub fn send_cost(kind: SendKind, template: Option<&MessageTemplate>) -> f64 {
    match kind {
        SendKind::Template => template.map(|t| t.cost).unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn template_log_text(name: &str, parameters: &[String]) -> String {
    if parameters.is_empty() {
        format!("Template: {name}")
    } else {
        format!("Template: {} [{}]", name, parameters.join(", "))
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: SendKind,
    pub text: String,
    pub media_id: Option<String>,
    pub template_name: String,
    pub language_code: String,
    pub parameters: Vec<String>,
}

impl OutboundMessage {
    pub fn text(body: &str) -> OutboundMessage {
        OutboundMessage {
            kind: SendKind::Text,
            text: body.to_string(),
            media_id: None,
            template_name: String::new(),
            language_code: String::new(),
            parameters: Vec::new(),
        }
    }

    pub fn media(kind: SendKind, media_id: &str, caption: &str) -> OutboundMessage {
        OutboundMessage {
            kind,
            text: caption.to_string(),
            media_id: Some(media_id.to_string()),
            template_name: String::new(),
            language_code: String::new(),
            parameters: Vec::new(),
        }
    }

    pub fn template(template: &MessageTemplate, parameters: Vec<String>) -> OutboundMessage {
        OutboundMessage {
            kind: SendKind::Template,
            text: String::new(),
            media_id: None,
            template_name: template.name.clone(),
            language_code: template.language_code.clone(),
            parameters,
        }
    }
}

/// Provider wire payload for one outbound message, keyed by kind. Template
/// variables become an ordered positional parameter list under the body
/// component.
pub fn message_payload(to: &str, message: &OutboundMessage) -> Value {
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": message.kind.as_str(),
    });
    let media_id = message.media_id.as_deref().unwrap_or("");
    match message.kind {
        SendKind::Text => {
            payload["text"] = json!({ "preview_url": false, "body": message.text });
        }
        SendKind::Image => {
            payload["image"] = json!({ "id": media_id, "caption": message.text });
        }
        SendKind::Audio => {
            payload["audio"] = json!({ "id": media_id });
        }
        SendKind::Document => {
            payload["document"] = json!({ "id": media_id, "caption": message.text });
        }
        SendKind::Template => {
            let mut template = json!({
                "name": message.template_name,
                "language": { "code": message.language_code }
            });
            if !message.parameters.is_empty() {
                let parameters = message
                    .parameters
                    .iter()
                    .map(|value| json!({ "type": "text", "text": value }))
                    .collect::<Vec<_>>();
                template["components"] = json!([{
                    "type": "body",
                    "parameters": parameters
                }]);
            }
            payload["template"] = template;
        }
    }
    payload
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status_code: u16,
    pub body: Value,
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self.status_code, 200 | 201)
    }
}

/// Thin client over the provider messaging API. Knows nothing about contacts
/// or message rows; maps one request to one response.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    api_base: String,
    access_token: String,
    phone_number_id: String,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        api_base: String,
        access_token: String,
        phone_number_id: String,
    ) -> Dispatcher {
        Dispatcher {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token,
            phone_number_id,
        }
    }

    /// Sends one message. Transport failures never surface as errors; they
    /// come back as a 500 outcome with the error text so callers only ever
    /// branch on the status code.
    pub async fn send(&self, phone: &str, message: &OutboundMessage) -> DispatchOutcome {
        let to = normalize_phone(phone);
        let payload = message_payload(&to, message);
        let response = match self
            .client
            .post(format!(
                "{}/{}/messages",
                self.api_base, self.phone_number_id
            ))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return DispatchOutcome {
                    status_code: 500,
                    body: json!({ "error": err.to_string() }),
                };
            }
        };
        let status_code = response.status().as_u16();
        let raw_body = response.text().await.unwrap_or_default();
        let body =
            serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
        DispatchOutcome { status_code, body }
    }

    pub async fn upload_media(
        &self,
        bytes: Bytes,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String, String> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| e.to_string())?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);
        let response = self
            .client
            .post(format!("{}/{}/media", self.api_base, self.phone_number_id))
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("media upload error {}: {}", status.as_u16(), body));
        }
        let payload = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "missing media id from provider".to_string())
    }

    /// Fetches media metadata, then follows the short-lived download URL.
    /// Both calls are bearer-authenticated.
    pub async fn fetch_media(&self, media_id: &str) -> Result<(Bytes, String), String> {
        let metadata_response = self
            .client
            .get(format!("{}/{}", self.api_base, media_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !metadata_response.status().is_success() {
            let status = metadata_response.status();
            let body = metadata_response.text().await.unwrap_or_default();
            return Err(format!(
                "media metadata error {}: {}",
                status.as_u16(),
                body
            ));
        }
        let metadata = metadata_response
            .json::<Value>()
            .await
            .unwrap_or_else(|_| json!({}));
        let media_url = metadata
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if media_url.is_empty() {
            return Err("missing media url from provider".to_string());
        }
        let fallback_mime = metadata
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();

        let media_response = self
            .client
            .get(media_url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !media_response.status().is_success() {
            let status = media_response.status();
            let body = media_response.text().await.unwrap_or_default();
            return Err(format!(
                "media download error {}: {}",
                status.as_u16(),
                body
            ));
        }
        let content_type = media_response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&fallback_mime)
            .to_string();
        let bytes = media_response.bytes().await.map_err(|e| e.to_string())?;
        Ok((bytes, content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, cost: f64) -> MessageTemplate {
        MessageTemplate {
            id: "t1".to_string(),
            name: name.to_string(),
            language_code: "pt_BR".to_string(),
            cost,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn normalize_drops_extra_ninth_digit() {
        assert_eq!(normalize_phone("5531988887777"), "553188887777");
    }

    #[test]
    fn normalize_strips_formatting_only_for_other_lengths() {
        assert_eq!(normalize_phone("+55 (31) 8888-7777"), "553188887777");
        assert_eq!(normalize_phone("553188887777"), "553188887777");
        assert_eq!(normalize_phone("31988887777"), "31988887777");
        assert_eq!(normalize_phone("1131988887777"), "1131988887777");
        assert_eq!(normalize_phone("abc"), "");
    }

    #[test]
    fn broadcast_parsing_prefixes_and_discards_short_tokens() {
        let numbers = parse_broadcast_numbers("11999998888, 31988887777\n12345");
        assert_eq!(numbers, vec!["5511999998888", "5531988887777"]);
    }

    #[test]
    fn broadcast_parsing_deduplicates() {
        let numbers = parse_broadcast_numbers("31988887777,5531988887777\n31988887777");
        assert_eq!(numbers, vec!["5531988887777"]);
    }

    #[test]
    fn broadcast_parsing_empty_input() {
        assert!(parse_broadcast_numbers("").is_empty());
        assert!(parse_broadcast_numbers("abc, 123").is_empty());
    }

    #[test]
    fn text_payload_shape() {
        let payload = message_payload("553188887777", &OutboundMessage::text("hello"));
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["to"], "553188887777");
        assert_eq!(payload["text"]["body"], "hello");
        assert_eq!(payload["messaging_product"], "whatsapp");
    }

    #[test]
    fn media_payload_carries_provider_id() {
        let payload = message_payload(
            "553188887777",
            &OutboundMessage::media(SendKind::Image, "media-9", "see this"),
        );
        assert_eq!(payload["type"], "image");
        assert_eq!(payload["image"]["id"], "media-9");
        assert_eq!(payload["image"]["caption"], "see this");
    }

    #[test]
    fn template_payload_attaches_ordered_body_parameters() {
        let message =
            OutboundMessage::template(&template("boas_vindas", 0.5), vec![
                "Maria".to_string(),
                "segunda".to_string(),
            ]);
        let payload = message_payload("553188887777", &message);
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["name"], "boas_vindas");
        assert_eq!(payload["template"]["language"]["code"], "pt_BR");
        let parameters = &payload["template"]["components"][0]["parameters"];
        assert_eq!(parameters[0]["text"], "Maria");
        assert_eq!(parameters[1]["text"], "segunda");
    }

    #[test]
    fn template_payload_omits_components_without_parameters() {
        let message = OutboundMessage::template(&template("boas_vindas", 0.5), Vec::new());
        let payload = message_payload("553188887777", &message);
        assert!(payload["template"].get("components").is_none());
    }

    #[test]
    fn cost_is_zero_for_non_template_kinds() {
        let t = template("promo", 0.38);
        assert_eq!(send_cost(SendKind::Text, Some(&t)), 0.0);
        assert_eq!(send_cost(SendKind::Image, Some(&t)), 0.0);
        assert_eq!(send_cost(SendKind::Template, Some(&t)), 0.38);
        assert_eq!(send_cost(SendKind::Template, None), 0.0);
    }

    #[test]
    fn template_log_text_names_template_and_variables() {
        assert_eq!(template_log_text("promo", &[]), "Template: promo");
        assert_eq!(
            template_log_text("promo", &["a".to_string(), "b".to_string()]),
            "Template: promo [a, b]"
        );
    }
}
