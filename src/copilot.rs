use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::header::{COOKIE, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use crate::client::{ClientError, ResponseStream};
use crate::cmd::CmdOptions;
use crate::config;

const CREATE_URL: &str =
    "https://copilot.microsoft.com/turing/conversation/create?bundleVersion=1.1809.0";
const CHATHUB_URL: &str = "wss://sydney.bing.com/sydney/ChatHub";
const SIGNATURE_HEADER: &str = "X-Sydney-EncryptedConversationSignature";

/// SignalR messages are delimited by an ASCII record-separator.
const RECORD_SEPARATOR: char = '\u{1e}';

// The service rejects non-browser user agents.
const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live Copilot connection holding one server-side conversation. Each
/// ask/compose opens a fresh ChatHub socket against that conversation.
pub struct CopilotClient {
    http: reqwest::Client,
    cookies: String,
    conversation: Conversation,
    debug: bool,
    /// Shared with producer tasks which refresh them from the server's
    /// throttling info on each final record.
    user_messages: Arc<AtomicU32>,
    max_user_messages: Arc<AtomicU32>,
}

#[derive(Clone, Debug)]
struct Conversation {
    conversation_id: String,
    client_id: String,
    /// Encrypted conversation signature, passed back as the ChatHub access
    /// token. Older deployments omit it.
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(rename = "clientId")]
    client_id: Option<String>,
    result: Option<CreateResult>,
}

#[derive(Debug, Deserialize)]
struct CreateResult {
    value: Option<String>,
}

impl CopilotClient {
    pub async fn start(cookies: &str, debug: bool) -> Result<CopilotClient, ClientError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|_| ClientError::NoConnection)?;
        let conversation = create_conversation(&http, cookies, debug).await?;
        Ok(CopilotClient {
            http,
            cookies: cookies.to_string(),
            conversation,
            debug,
            user_messages: Arc::new(AtomicU32::new(0)),
            max_user_messages: Arc::new(AtomicU32::new(0)),
        })
    }

    /// The service has no conversation-teardown endpoint; closing drops local
    /// state and lets the service expire the conversation server-side.
    pub async fn close_conversation(&mut self) -> Result<(), ClientError> {
        self.user_messages.store(0, Ordering::SeqCst);
        self.max_user_messages.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Replaces the server-side conversation under the same handle, clearing
    /// all conversation state. Used by the conversation-limit recovery path.
    pub async fn reset_conversation(&mut self) -> Result<(), ClientError> {
        self.conversation = create_conversation(&self.http, &self.cookies, self.debug).await?;
        self.user_messages.store(0, Ordering::SeqCst);
        self.max_user_messages.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub async fn ask_stream(
        &mut self,
        prompt: &str,
        options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        let invocation = self.build_invocation(prompt, options);
        self.invoke(invocation, options).await
    }

    pub async fn compose_stream(
        &mut self,
        prompt: &str,
        options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        let compose_prompt = build_compose_prompt(prompt, options);
        let invocation = self.build_invocation(&compose_prompt, options);
        self.invoke(invocation, options).await
    }

    async fn invoke(
        &mut self,
        invocation: serde_json::Value,
        options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        self.check_conversation_limit()?;
        let raw = options.get("raw").map(|v| v.as_bool()).unwrap_or(false);
        let want_suggestions = options
            .get("suggestions")
            .map(|v| v.as_bool())
            .unwrap_or(false);

        let mut ws = self.connect_chathub().await?;

        // SignalR handshake: version negotiation, then an empty ack record.
        send_record(&mut ws, &json!({"protocol": "json", "version": 1})).await?;
        match tokio::time::timeout(CONNECT_TIMEOUT, ws.next()).await {
            Err(_) => return Err(ClientError::ConnectionTimeout),
            Ok(None) | Ok(Some(Err(_))) => return Err(ClientError::NoConnection),
            Ok(Some(Ok(_))) => {}
        }
        send_record(&mut ws, &json!({"type": 6})).await?;
        send_record(&mut ws, &invocation).await?;
        self.user_messages.fetch_add(1, Ordering::SeqCst);

        let (tx, stream) = ResponseStream::channel(64);
        tokio::spawn(stream_records(
            ws,
            tx,
            raw,
            want_suggestions,
            self.debug,
            self.user_messages.clone(),
            self.max_user_messages.clone(),
        ));
        Ok(stream)
    }

    fn check_conversation_limit(&self) -> Result<(), ClientError> {
        let max = self.max_user_messages.load(Ordering::SeqCst);
        if max > 0 && self.user_messages.load(Ordering::SeqCst) >= max {
            return Err(ClientError::ConversationLimit);
        }
        Ok(())
    }

    async fn connect_chathub(&self) -> Result<WsStream, ClientError> {
        let url = match &self.conversation.signature {
            Some(signature) => format!(
                "{}?sec_access_token={}",
                CHATHUB_URL,
                urlencoding::encode(signature)
            ),
            None => CHATHUB_URL.to_string(),
        };
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)?
            .map_err(|_| ClientError::NoConnection)?;
        Ok(ws)
    }

    fn build_invocation(&self, prompt: &str, options: &CmdOptions) -> serde_json::Value {
        let request_id = Uuid::new_v4().to_string();
        let is_start = self.user_messages.load(Ordering::SeqCst) == 0;

        let mut options_sets = vec![
            "nlu_direct_response_filter",
            "deepleo",
            "disable_emoji_spoken_text",
            "responsible_ai_policy_235",
            "enablemm",
            "dv3sugg",
        ];
        if options.get("citations").map(|v| v.as_bool()).unwrap_or(false) {
            options_sets.push("enable_citations");
        }

        let mut message = json!({
            "author": "user",
            "inputMethod": "Keyboard",
            "text": prompt,
            "messageType": "Chat",
            "requestId": request_id,
            "messageId": request_id,
        });
        if let Some(attachment) = options.get("attachment") {
            message["imageUrl"] = json!(attachment.to_string());
        }

        let mut arguments = json!({
            "source": "cib",
            "optionsSets": options_sets,
            "allowedMessageTypes": ["Chat", "InternalSearchQuery", "Disengaged"],
            "isStartOfSession": is_start,
            "requestId": request_id,
            "message": message,
            "conversationId": self.conversation.conversation_id,
            "participant": { "id": self.conversation.client_id },
        });
        if let Some(context) = options.get("context") {
            arguments["previousMessages"] = json!([{
                "author": "user",
                "description": context.to_string(),
                "contextType": "WebPage",
                "messageType": "Context",
            }]);
        }

        json!({
            "arguments": [arguments],
            "invocationId": self.user_messages.load(Ordering::SeqCst).to_string(),
            "target": "chat",
            "type": 4,
        })
    }
}

async fn create_conversation(
    http: &reqwest::Client,
    cookies: &str,
    debug: bool,
) -> Result<Conversation, ClientError> {
    let res = http
        .get(CREATE_URL)
        .header(
            COOKIE,
            HeaderValue::from_str(cookies).map_err(|_| ClientError::CreateConversation)?,
        )
        .header(USER_AGENT, HeaderValue::from_static(BROWSER_UA))
        .send()
        .await
        .map_err(map_reqwest_err)?;
    if !res.status().is_success() {
        return Err(ClientError::CreateConversation);
    }
    let signature = res
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body: CreateResponse = res
        .json()
        .await
        .map_err(|_| ClientError::CreateConversation)?;
    if debug {
        let _ = config::write_to_debug_log(format!("--- copilot create {:?}\n", body));
    }
    match body.result.and_then(|r| r.value).as_deref() {
        Some("Success") => {}
        _ => return Err(ClientError::CreateConversation),
    }
    Ok(Conversation {
        conversation_id: body
            .conversation_id
            .ok_or(ClientError::CreateConversation)?,
        client_id: body.client_id.ok_or(ClientError::CreateConversation)?,
        signature,
    })
}

fn map_reqwest_err(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::ConnectionTimeout
    } else {
        ClientError::NoConnection
    }
}

async fn send_record(ws: &mut WsStream, record: &serde_json::Value) -> Result<(), ClientError> {
    let mut payload = record.to_string();
    payload.push(RECORD_SEPARATOR);
    ws.send(Message::Text(Utf8Bytes::from(&payload)))
        .await
        .map_err(|_| ClientError::NoConnection)
}

/// Producer half of a response stream: reads ChatHub records off the socket
/// and forwards text deltas (type 1) until the final record (type 2) lands.
async fn stream_records(
    mut ws: WsStream,
    tx: mpsc::Sender<Result<String, ClientError>>,
    raw: bool,
    want_suggestions: bool,
    debug: bool,
    user_messages: Arc<AtomicU32>,
    max_user_messages: Arc<AtomicU32>,
) {
    // Byte length of response text already forwarded; type-1 records carry
    // the full text so far, not a delta.
    let mut sent_len = 0usize;
    let mut buffer = String::new();

    while let Some(msg) = ws.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => {
                let _ = tx.send(Err(ClientError::NoConnection)).await;
                return;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        buffer.push_str(&text);
        while let Some(idx) = buffer.find(RECORD_SEPARATOR) {
            let record: String = buffer[..idx].to_string();
            buffer.drain(..=idx);
            if record.is_empty() {
                continue;
            }
            if debug {
                let _ = config::write_to_debug_log(format!("{}\n", record));
            }
            let json: serde_json::Value = match serde_json::from_str(&record) {
                Ok(json) => json,
                Err(_) => continue,
            };
            if raw && json["type"].as_i64().is_some() {
                if tx.send(Ok(format!("{}\n", record))).await.is_err() {
                    return;
                }
            }
            match json["type"].as_i64() {
                Some(1) => {
                    if raw {
                        continue;
                    }
                    if let Some(text) = json["arguments"][0]["messages"][0]["text"].as_str() {
                        if text.len() > sent_len {
                            let chunk = text[sent_len..].to_string();
                            sent_len = text.len();
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(2) => {
                    let item = &json["item"];
                    if let Some(max) =
                        item["throttling"]["maxNumUserMessagesInConversation"].as_u64()
                    {
                        max_user_messages.store(max as u32, Ordering::SeqCst);
                    }
                    if let Some(num) = item["throttling"]["numUserMessagesInConversation"].as_u64()
                    {
                        user_messages.store(num as u32, Ordering::SeqCst);
                    }
                    match item["result"]["value"].as_str() {
                        Some("Success") | None => {
                            if !raw {
                                // Forward any tail the updates didn't cover.
                                if let Some(text) = final_message_text(item) {
                                    if text.len() > sent_len {
                                        let chunk = text[sent_len..].to_string();
                                        sent_len = text.len();
                                        if tx.send(Ok(chunk)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                if want_suggestions {
                                    if let Some(suggestions) = collect_suggestions(item) {
                                        let _ = tx.send(Ok(suggestions)).await;
                                    }
                                }
                                if sent_len == 0 {
                                    let _ = tx.send(Err(ClientError::NoResponse)).await;
                                }
                            }
                        }
                        Some("Throttled") => {
                            let _ = tx.send(Err(ClientError::Throttled)).await;
                        }
                        Some("CaptchaChallenge") => {
                            let _ = tx.send(Err(ClientError::CaptchaChallenge)).await;
                        }
                        Some(other) => {
                            let _ = tx.send(Err(ClientError::Protocol(other.to_string()))).await;
                        }
                    }
                    let _ = ws.close(None).await;
                    return;
                }
                // Keep-alive ping
                Some(6) => {
                    let _ = send_record(&mut ws, &json!({"type": 6})).await;
                }
                // Connection is being closed by the server
                Some(7) => {
                    let _ = tx.send(Err(ClientError::NoConnection)).await;
                    return;
                }
                _ => {}
            }
        }
    }
    // Socket ended without a final record
    let _ = tx.send(Err(ClientError::NoResponse)).await;
}

fn final_message_text(item: &serde_json::Value) -> Option<&str> {
    let messages = item["messages"].as_array()?;
    messages
        .iter()
        .rev()
        .find(|m| m["author"].as_str() == Some("bot") && m["messageType"].is_null())
        .and_then(|m| m["text"].as_str())
}

fn collect_suggestions(item: &serde_json::Value) -> Option<String> {
    let messages = item["messages"].as_array()?;
    let suggestions: Vec<&str> = messages
        .iter()
        .rev()
        .find_map(|m| m["suggestedResponses"].as_array())?
        .iter()
        .filter_map(|s| s["text"].as_str())
        .collect();
    if suggestions.is_empty() {
        return None;
    }
    let mut out = String::from("\n\nSuggested responses:\n");
    for suggestion in suggestions {
        out.push_str(&format!("- {}\n", suggestion));
    }
    Some(out)
}

fn build_compose_prompt(prompt: &str, options: &CmdOptions) -> String {
    let tone = options
        .get("tone")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "professional".to_string());
    let format = options
        .get("format")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "paragraph".to_string());
    let length = options
        .get("length")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "short".to_string());
    format!(
        "Please compose content from the following keywords, in the same language as the \
         keywords. Do not restate any part of this request in your response. \
         The keywords are: `{}`. The generated text should follow these characteristics: \
         format: *{}*, length: *{}*, using *{}* tone.",
        prompt, format, length, tone
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::OptionValue;
    use std::collections::HashMap;

    #[test]
    fn test_compose_prompt_defaults() {
        let prompt = build_compose_prompt("a haiku about autumn", &HashMap::new());
        assert!(prompt.contains("`a haiku about autumn`"));
        assert!(prompt.contains("format: *paragraph*"));
        assert!(prompt.contains("length: *short*"));
        assert!(prompt.contains("*professional* tone"));
    }

    #[test]
    fn test_compose_prompt_options_pass_through() {
        let mut options = HashMap::new();
        options.insert("tone".to_string(), OptionValue::Str("funny".to_string()));
        options.insert("format".to_string(), OptionValue::Str("email".to_string()));
        options.insert("length".to_string(), OptionValue::Str("long".to_string()));
        let prompt = build_compose_prompt("office party", &options);
        assert!(prompt.contains("format: *email*"));
        assert!(prompt.contains("length: *long*"));
        assert!(prompt.contains("*funny* tone"));
    }

    #[test]
    fn test_collect_suggestions() {
        let item = serde_json::json!({
            "messages": [{
                "author": "bot",
                "text": "answer",
                "suggestedResponses": [
                    {"text": "Tell me more"},
                    {"text": "Another example"},
                ],
            }],
        });
        let suggestions = collect_suggestions(&item).unwrap();
        assert!(suggestions.contains("- Tell me more"));
        assert!(suggestions.contains("- Another example"));
    }

    #[test]
    fn test_final_message_text_skips_non_chat_messages() {
        let item = serde_json::json!({
            "messages": [
                {"author": "bot", "messageType": "InternalSearchQuery", "text": "query"},
                {"author": "bot", "text": "the real answer"},
            ],
        });
        assert_eq!(final_message_text(&item), Some("the real answer"));
    }
}
