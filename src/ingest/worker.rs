//! Background intake worker
//!
//! Producer collaborators (content generation workflows) resolve content out
//! of band and report back here. The worker serializes intake onto the
//! engine's binding path so producers never hold a database handle.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::engine::ConversationEngine;
use crate::error::{BraidError, Result};
use crate::types::AlternativeId;

/// Commands for the intake worker
#[derive(Debug)]
pub enum IngestCommand {
    /// A producer finished: bind the resolved content reference
    ContentResolved {
        alternative_id: AlternativeId,
        content_ref: String,
    },
    /// A producer failed; the alternative stays pending
    ProducerFailed {
        alternative_id: AlternativeId,
        reason: String,
    },
    /// Stop the worker
    Stop,
}

/// Background intake worker
pub struct IngestWorker {
    sender: mpsc::Sender<IngestCommand>,
}

impl IngestWorker {
    /// Start the intake worker over a shared engine
    pub fn start(engine: Arc<ConversationEngine>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<IngestCommand>(100);

        tokio::spawn(async move {
            while let Some(cmd) = receiver.recv().await {
                match cmd {
                    IngestCommand::ContentResolved {
                        alternative_id,
                        content_ref,
                    } => match engine.bind_content(alternative_id, &content_ref).await {
                        Ok(alternative) => {
                            tracing::debug!(
                                alternative_id = %alternative.id,
                                "intake bound content"
                            );
                        }
                        Err(BraidError::Conflict { existing, .. }) => {
                            tracing::warn!(
                                alternative_id = %alternative_id,
                                existing,
                                attempted = content_ref,
                                "intake rejected: alternative already bound"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                alternative_id = %alternative_id,
                                error = %e,
                                "intake binding failed"
                            );
                        }
                    },
                    IngestCommand::ProducerFailed {
                        alternative_id,
                        reason,
                    } => {
                        engine.handle_producer_failure(alternative_id, &reason);
                    }
                    IngestCommand::Stop => break,
                }
            }

            tracing::info!("Intake worker stopped");
        });

        Self { sender }
    }

    /// Report a resolved content reference
    pub async fn content_resolved(
        &self,
        alternative_id: AlternativeId,
        content_ref: String,
    ) -> Result<()> {
        self.sender
            .send(IngestCommand::ContentResolved {
                alternative_id,
                content_ref,
            })
            .await
            .map_err(|_| BraidError::Internal("Intake worker channel closed".to_string()))
    }

    /// Report a producer failure
    pub async fn producer_failed(&self, alternative_id: AlternativeId, reason: String) -> Result<()> {
        self.sender
            .send(IngestCommand::ProducerFailed {
                alternative_id,
                reason,
            })
            .await
            .map_err(|_| BraidError::Internal("Intake worker channel closed".to_string()))
    }

    /// Stop the worker
    pub async fn stop(&self) -> Result<()> {
        self.sender
            .send(IngestCommand::Stop)
            .await
            .map_err(|_| BraidError::Internal("Intake worker channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewTurn;
    use crate::realtime::EventType;
    use crate::storage::Storage;
    use crate::types::{EngineConfig, Speaker, TurnType};

    #[tokio::test]
    async fn test_intake_binds_content() {
        let storage = Storage::open_in_memory().unwrap();
        let engine =
            Arc::new(ConversationEngine::new(storage, EngineConfig::default()).unwrap());
        let worker = IngestWorker::start(engine.clone());

        let conversation = engine
            .create_conversation("owner-1", "Intake", None)
            .await
            .unwrap();
        let (_, alt) = engine
            .create_turn(NewTurn {
                conversation_id: conversation.id,
                parent_turn_id: None,
                speaker: Speaker::User,
                turn_type: TurnType::Message,
                content: "hello".to_string(),
                initial_parent_alternative_ref: None,
                producer_ref: None,
            })
            .await
            .unwrap();

        let mut rx = engine.subscribe();
        worker
            .content_resolved(alt.id, "ep-1".to_string())
            .await
            .unwrap();

        // The bind lands asynchronously; the event tells us it committed
        loop {
            let event = rx.recv().await.unwrap();
            if event.event_type == EventType::ContentBound {
                assert_eq!(event.alternative_id, Some(alt.id));
                break;
            }
        }

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_producer_failure_keeps_alternative_pending() {
        let storage = Storage::open_in_memory().unwrap();
        let engine =
            Arc::new(ConversationEngine::new(storage, EngineConfig::default()).unwrap());
        let worker = IngestWorker::start(engine.clone());

        let conversation = engine
            .create_conversation("owner-1", "Failures", None)
            .await
            .unwrap();
        let (_, alt) = engine
            .create_turn(NewTurn {
                conversation_id: conversation.id,
                parent_turn_id: None,
                speaker: Speaker::User,
                turn_type: TurnType::Message,
                content: "hello".to_string(),
                initial_parent_alternative_ref: None,
                producer_ref: None,
            })
            .await
            .unwrap();

        let mut rx = engine.subscribe();
        worker
            .producer_failed(alt.id, "upstream timeout".to_string())
            .await
            .unwrap();

        loop {
            let event = rx.recv().await.unwrap();
            if event.event_type == EventType::ProducerFailed {
                assert_eq!(event.alternative_id, Some(alt.id));
                break;
            }
        }

        worker.stop().await.unwrap();
    }
}
