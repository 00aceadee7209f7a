use std::error::Error;
use std::fmt;

use tokio::sync::mpsc;

use crate::cmd::CmdOptions;
use crate::copilot::CopilotClient;
use crate::void::{VoidClient, VoidCounters};

/// Fault taxonomy of the remote conversational service. Variants mirror the
/// result codes Copilot reports plus the transport-level failure modes.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientError {
    NoConnection,
    ConnectionTimeout,
    NoResponse,
    Throttled,
    CaptchaChallenge,
    ConversationLimit,
    CreateConversation,
    GetConversations,
    Protocol(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NoConnection => write!(f, "no connection to the service"),
            ClientError::ConnectionTimeout => write!(f, "connection timed out"),
            ClientError::NoResponse => write!(f, "no response was returned"),
            ClientError::Throttled => write!(f, "request was throttled"),
            ClientError::CaptchaChallenge => write!(f, "captcha challenge required"),
            ClientError::ConversationLimit => write!(f, "conversation limit reached"),
            ClientError::CreateConversation => write!(f, "failed to create conversation"),
            ClientError::GetConversations => write!(f, "failed to retrieve conversations"),
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl Error for ClientError {}

/// A finite, non-restartable sequence of response text fragments. A producer
/// task feeds the channel; consuming ends when the producer hangs up.
/// Mid-stream faults arrive in-band as `Err` items.
pub struct ResponseStream {
    rx: mpsc::Receiver<Result<String, ClientError>>,
}

impl ResponseStream {
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<String, ClientError>>, ResponseStream) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, ResponseStream { rx })
    }

    pub async fn next(&mut self) -> Option<Result<String, ClientError>> {
        self.rx.recv().await
    }
}

/// Specifies which provider a session manager should construct on first use.
#[derive(Clone, Debug)]
pub enum ClientSpec {
    Copilot {
        cookies: String,
    },
    /// For testing only
    Void {
        scenario: String,
        counters: VoidCounters,
    },
}

/// A live connection to the remote assistant with a started conversation.
pub enum Client {
    Copilot(CopilotClient),
    /// For testing only
    Void(VoidClient),
}

impl Client {
    /// Constructs the provider and starts its conversation. May suspend on
    /// network I/O.
    pub async fn open(spec: &ClientSpec, debug: bool) -> Result<Client, ClientError> {
        match spec {
            ClientSpec::Copilot { cookies } => {
                Ok(Client::Copilot(CopilotClient::start(cookies, debug).await?))
            }
            ClientSpec::Void { scenario, counters } => Ok(Client::Void(
                VoidClient::start(scenario, counters.clone()).await?,
            )),
        }
    }

    pub async fn close_conversation(&mut self) -> Result<(), ClientError> {
        match self {
            Client::Copilot(client) => client.close_conversation().await,
            Client::Void(client) => client.close_conversation().await,
        }
    }

    pub async fn reset_conversation(&mut self) -> Result<(), ClientError> {
        match self {
            Client::Copilot(client) => client.reset_conversation().await,
            Client::Void(client) => client.reset_conversation().await,
        }
    }

    pub async fn ask_stream(
        &mut self,
        prompt: &str,
        options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        match self {
            Client::Copilot(client) => client.ask_stream(prompt, options).await,
            Client::Void(client) => client.ask_stream(prompt, options).await,
        }
    }

    pub async fn compose_stream(
        &mut self,
        prompt: &str,
        options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        match self {
            Client::Copilot(client) => client.compose_stream(prompt, options).await,
            Client::Void(client) => client.compose_stream(prompt, options).await,
        }
    }
}
