/// This is a provider exclusively for testing.
///
/// Scenarios are keyed by a string (the `SYDNEY_VOID` env var, or whatever a
/// test passes in) and the counters let tests observe session lifecycle calls
/// after the client itself has been dropped.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::client::{ClientError, ResponseStream};
use crate::cmd::CmdOptions;

#[derive(Clone, Debug, Default)]
pub struct VoidCounters {
    pub opened: Arc<AtomicU32>,
    pub closed: Arc<AtomicU32>,
    pub resets: Arc<AtomicU32>,
    pub asks: Arc<AtomicU32>,
    pub composes: Arc<AtomicU32>,
}

// Most accessors are only exercised by lifecycle tests.
#[allow(dead_code)]
impl VoidCounters {
    pub fn new() -> VoidCounters {
        VoidCounters::default()
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn asks(&self) -> u32 {
        self.asks.load(Ordering::SeqCst)
    }

    pub fn composes(&self) -> u32 {
        self.composes.load(Ordering::SeqCst)
    }
}

pub struct VoidClient {
    scenario: String,
    counters: VoidCounters,
}

impl VoidClient {
    pub async fn start(scenario: &str, counters: VoidCounters) -> Result<VoidClient, ClientError> {
        counters.opened.fetch_add(1, Ordering::SeqCst);
        if scenario == "create-conversation" {
            return Err(ClientError::CreateConversation);
        }
        Ok(VoidClient {
            scenario: scenario.to_string(),
            counters,
        })
    }

    pub async fn close_conversation(&mut self) -> Result<(), ClientError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn reset_conversation(&mut self) -> Result<(), ClientError> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn ask_stream(
        &mut self,
        prompt: &str,
        _options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        self.counters.asks.fetch_add(1, Ordering::SeqCst);
        match self.scenario.as_str() {
            "no-connection" => Err(ClientError::NoConnection),
            "timeout" => Err(ClientError::ConnectionTimeout),
            "no-response" => Err(ClientError::NoResponse),
            "throttled" => Err(ClientError::Throttled),
            "captcha" => Err(ClientError::CaptchaChallenge),
            "get-conversations" => Err(ClientError::GetConversations),
            "limit-always" => Err(ClientError::ConversationLimit),
            "limit-once" => {
                // Recovers after the dispatcher's reset
                if self.counters.resets() == 0 {
                    Err(ClientError::ConversationLimit)
                } else {
                    Ok(scripted_stream(vec!["recovered: ".into(), prompt.to_string()]))
                }
            }
            "readme-markers" => Ok(scripted_stream(vec![
                "noise<sydney_res".into(),
                "ponse>## Title\nbody</sydney".into(),
                "_response>trailer".into(),
            ])),
            _ => Ok(scripted_stream(vec![
                "hello".into(),
                ",".into(),
                " world".into(),
            ])),
        }
    }

    pub async fn compose_stream(
        &mut self,
        _prompt: &str,
        _options: &CmdOptions,
    ) -> Result<ResponseStream, ClientError> {
        self.counters.composes.fetch_add(1, Ordering::SeqCst);
        Ok(scripted_stream(vec![
            "once".into(),
            " upon".into(),
            " a time".into(),
        ]))
    }
}

fn scripted_stream(fragments: Vec<String>) -> ResponseStream {
    let (tx, stream) = ResponseStream::channel(16);
    tokio::spawn(async move {
        for fragment in fragments {
            if tx.send(Ok(fragment)).await.is_err() {
                return;
            }
        }
    });
    stream
}
