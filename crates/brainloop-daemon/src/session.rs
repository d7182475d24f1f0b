//! The iterative generation session manager.
//!
//! Sessions run a propose → audit → refine → commit workflow over one or
//! more blocks. The temperature ladder is fixed by design: 0.6 on propose,
//! 0.3 on refine, 0.1 on commit. Commits are gated by the processed-log
//! ledger on `SHA-256(session_id || block_id || final_code)`: a repeated
//! commit applies no side effect and returns the recorded result.

use std::path::Path;
use std::sync::Arc;

use brainloop_core::generation::temperature;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::storage::lifecycle::{
    BlockRow, LifecycleStore, BLOCK_COMMITTED, STATUS_ABANDONED, STATUS_COMMITTED,
};
use crate::storage::{MetadataStore, OutputStore};

/// Block types a session can carry.
pub const BLOCK_TYPES: &[&str] = &["sql", "go", "python", "code"];

/// One block as submitted to `propose`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInput {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(rename = "type")]
    pub block_type: String,
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct ProposeResponse {
    pub session_id: String,
    pub blocks: Vec<BlockRow>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub block: BlockRow,
}

#[derive(Debug, Serialize)]
pub struct RefineResponse {
    pub block: BlockRow,
    pub refined_code: String,
    pub iterations: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub block_id: String,
    pub success: bool,
    pub message: String,
    pub output_path: String,
}

pub struct SessionManager {
    lifecycle: LifecycleStore,
    output: OutputStore,
    metadata: MetadataStore,
    gateway: Arc<Gateway>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        lifecycle: LifecycleStore,
        output: OutputStore,
        metadata: MetadataStore,
        gateway: Arc<Gateway>,
    ) -> Self {
        Self {
            lifecycle,
            output,
            metadata,
            gateway,
        }
    }

    /// Creates a session and generates initial code for every block in
    /// parallel at the explore temperature. Any block failure abandons the
    /// whole session.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty block list or an unknown block type;
    /// generation failures propagate after the session is abandoned.
    pub async fn propose(&self, blocks: Vec<BlockInput>) -> Result<ProposeResponse> {
        if blocks.is_empty() {
            return Err(Error::InvalidInput(
                "propose requires at least one block".to_string(),
            ));
        }
        for block in &blocks {
            if !BLOCK_TYPES.contains(&block.block_type.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "unsupported block type: {}",
                    block.block_type
                )));
            }
        }

        let session_id = Uuid::new_v4().to_string();
        self.lifecycle.create_session(&session_id)?;

        let mut tasks: JoinSet<Result<String>> = JoinSet::new();
        for input in blocks {
            let block_id = input
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            self.lifecycle.create_block(
                &block_id,
                &session_id,
                &input.description,
                &input.block_type,
                &input.target,
            )?;

            let gateway = Arc::clone(&self.gateway);
            let lifecycle = self.lifecycle.clone();
            tasks.spawn(async move {
                let code = gateway
                    .generate_code(
                        "loop_propose",
                        &input.description,
                        &input.block_type,
                        None,
                        temperature::EXPLORE,
                    )
                    .await?;
                lifecycle.update_block_code(&block_id, &code)?;
                Ok(block_id)
            });
        }

        let mut failure: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => {},
                Ok(Err(err)) => failure = Some(err),
                Err(err) => failure = Some(Error::ExternalFailure(err.to_string())),
            }
        }

        if let Some(err) = failure {
            self.lifecycle.finish_session(&session_id, STATUS_ABANDONED)?;
            self.metadata.record_event(
                "session_abandoned",
                &format!("session {session_id} abandoned during propose: {err}"),
            );
            return Err(err);
        }

        let blocks = self.lifecycle.blocks_for_session(&session_id)?;
        Ok(ProposeResponse { session_id, blocks })
    }

    /// Returns the block verbatim. Read-only.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the block does not exist or belongs to another
    /// session.
    pub fn audit(&self, session_id: &str, block_id: &str) -> Result<AuditResponse> {
        let block = self.owned_block(session_id, block_id)?;
        Ok(AuditResponse { block })
    }

    /// Regenerates a block at the refine temperature from its description,
    /// current code, and the audit feedback. Appends a refinement row.
    pub async fn refine(
        &self,
        session_id: &str,
        block_id: &str,
        feedback: &str,
    ) -> Result<RefineResponse> {
        let block = self.owned_block(session_id, block_id)?;

        let prompt = format!(
            "Original requirement: {}\n\nCurrent code:\n{}\n\nFeedback: {}\n\n\
             Generate improved code addressing the feedback.",
            block.description,
            block.code.as_deref().unwrap_or(""),
            feedback
        );

        let refined = self
            .gateway
            .generate_code(
                "loop_refine",
                &prompt,
                &block.block_type,
                None,
                temperature::REFINE,
            )
            .await?;

        let refinement_id = Uuid::new_v4().to_string();
        self.lifecycle.record_refinement(
            &refinement_id,
            block_id,
            feedback,
            temperature::REFINE,
            &refined,
        )?;

        let block = self.owned_block(session_id, block_id)?;
        Ok(RefineResponse {
            iterations: block.iterations,
            refined_code: refined,
            block,
        })
    }

    /// Regenerates a final version at the commit temperature, applies the
    /// block-type side effect exactly once (ledger-gated), and marks the
    /// block committed.
    ///
    /// A repeated commit of the same final code returns the recorded
    /// result without touching the filesystem or the target database.
    pub async fn commit(&self, session_id: &str, block_id: &str) -> Result<CommitResponse> {
        let block = self.owned_block(session_id, block_id)?;

        let final_code = self
            .gateway
            .generate_code(
                "loop_commit",
                &block.description,
                &block.block_type,
                None,
                temperature::COMMIT,
            )
            .await?;

        let ledger_hash = commit_hash(session_id, block_id, &final_code);
        if let Some(prior) = self.lifecycle.get_processed(&ledger_hash)? {
            let recorded = prior.result_json.unwrap_or_default();
            let response: CommitResponse = serde_json::from_str(&recorded).map_err(|e| {
                Error::ExternalFailure(format!("recorded commit result unreadable: {e}"))
            })?;
            tracing::info!(block_id, "commit replay served from ledger");
            return Ok(response);
        }

        let apply = match block.block_type.as_str() {
            "sql" => execute_sql(&block.target, &final_code),
            "go" | "python" | "code" => write_file_atomically(&block.target, &final_code),
            other => Err(Error::InvalidInput(format!(
                "unsupported block type: {other}"
            ))),
        };
        if let Err(err) = apply {
            self.metadata.record_event(
                "commit_failed",
                &format!("block {block_id} commit failed: {err}"),
            );
            return Err(err);
        }

        let response = CommitResponse {
            block_id: block_id.to_string(),
            success: true,
            message: format!("block committed to {}", block.target),
            output_path: block.target.clone(),
        };
        let result_json = serde_json::to_string(&response)
            .map_err(|e| Error::ExternalFailure(e.to_string()))?;

        self.lifecycle
            .commit_block(block_id, &final_code, &ledger_hash, "commit", &result_json)?;

        self.maybe_complete_session(session_id)?;
        Ok(response)
    }

    /// Marks a session abandoned. Blocks stay as they are (logical
    /// delete via status).
    pub fn abandon(&self, session_id: &str) -> Result<()> {
        if self.lifecycle.get_session(session_id)?.is_none() {
            return Err(Error::InvalidInput(format!(
                "unknown session {session_id}"
            )));
        }
        self.lifecycle.finish_session(session_id, STATUS_ABANDONED)
    }

    fn owned_block(&self, session_id: &str, block_id: &str) -> Result<BlockRow> {
        let block = self
            .lifecycle
            .get_block(block_id)?
            .ok_or_else(|| Error::InvalidInput(format!("unknown block {block_id}")))?;
        if block.session_id != session_id {
            return Err(Error::InvalidInput(format!(
                "block {block_id} does not belong to session {session_id}"
            )));
        }
        Ok(block)
    }

    /// When every block is committed, the session completes and a summary
    /// row is published to the output database.
    fn maybe_complete_session(&self, session_id: &str) -> Result<()> {
        let blocks = self.lifecycle.blocks_for_session(session_id)?;
        if blocks.is_empty() || !blocks.iter().all(|b| b.status == BLOCK_COMMITTED) {
            return Ok(());
        }

        self.lifecycle.finish_session(session_id, STATUS_COMMITTED)?;

        let hash = hex::encode(Sha256::digest(session_id.as_bytes()));
        let data = serde_json::json!({
            "session_id": session_id,
            "blocks": blocks,
        });
        self.output.publish_result(
            &hash,
            session_id,
            blocks.len() as i64,
            &data.to_string(),
        )?;
        Ok(())
    }
}

/// `SHA-256(session_id || block_id || final_code)`, the commit ledger key.
#[must_use]
pub fn commit_hash(session_id: &str, block_id: &str, final_code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(block_id.as_bytes());
    hasher.update(final_code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Runs generated SQL against the target database inside a transaction;
/// any statement failure rolls the whole batch back.
pub(crate) fn execute_sql(db_path: &str, sql: &str) -> Result<()> {
    let mut conn = Connection::open(db_path)
        .map_err(|e| Error::InvalidInput(format!("cannot open target database: {e}")))?;
    let tx = conn.transaction()?;
    tx.execute_batch(sql)
        .map_err(|e| Error::InvalidInput(format!("generated SQL failed: {e}")))?;
    tx.commit()?;
    Ok(())
}

/// Atomically replaces `target`: write to a temp sibling, fsync, rename.
pub(crate) fn write_file_atomically(target: &str, contents: &str) -> Result<()> {
    let target_path = Path::new(target);
    let parent = target_path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        target_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "block".to_string()),
        Uuid::new_v4()
    ));

    let write = || -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, target_path)
    };
    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::InvalidInput(format!("cannot write {target}: {e}"))
    })
}
