//! A local-shell backend: runs each Call's command as a child process
//! in its call root. Reference implementation and the default for
//! single-node/dev deployments; informed by the sandboxed-spawn idiom
//! in `other_examples/.../process_execution/local.rs` (tokio `Command`,
//! captured stdout/stderr, working directory per execution) but much
//! simpler — no digest store, no named caches.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::cache::{HitStrategy, PriorResult};
use crate::model::{CallKey, Workflow, WorkflowOptions};

use super::{
    BackendContract, BackendError, BoundCall, CallOutcomeDetail, ExecutionHandle, InitData,
    PollOutcome, RetryabilityHint,
};

/// Runs Calls as child processes rooted at `work_dir_base/<workflow>/<call-root>`.
pub struct LocalShellBackend {
    work_dir_base: PathBuf,
}

impl LocalShellBackend {
    pub fn new(work_dir_base: impl Into<PathBuf>) -> Self {
        Self {
            work_dir_base: work_dir_base.into(),
        }
    }

    fn call_root_path(&self, call_key: &CallKey) -> PathBuf {
        self.work_dir_base
            .join(call_key.workflow_id.to_string())
            .join(call_key.call_root_segment())
    }
}

#[async_trait]
impl BackendContract for LocalShellBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn validate_options(&self, _options: &WorkflowOptions) -> Result<(), BackendError> {
        Ok(())
    }

    async fn initialize_workflow(&self, workflow: &Workflow) -> Result<InitData, BackendError> {
        tokio::fs::create_dir_all(self.work_dir_base.join(workflow.id.to_string()))
            .await
            .map_err(|e| BackendError::Initialization(e.to_string()))?;
        Ok(InitData::default())
    }

    async fn prepare_call(
        &self,
        call_key: &CallKey,
        _init_data: &InitData,
    ) -> Result<BoundCall, BackendError> {
        let call_root = self.call_root_path(call_key);
        tokio::fs::create_dir_all(&call_root)
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;
        Ok(BoundCall {
            call_key: call_key.clone(),
            call_root: call_root.to_string_lossy().to_string(),
            command: String::new(),
            input_mapping: BTreeMap::new(),
            runtime_attributes: serde_json::Map::new(),
        })
    }

    async fn execute(&self, bound: &BoundCall) -> Result<ExecutionHandle, BackendError> {
        let script_path = PathBuf::from(&bound.call_root).join("script");
        tokio::fs::write(&script_path, &bound.command)
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;

        let mut child = Command::new("/bin/sh")
            .arg(&script_path)
            .current_dir(&bound.call_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;

        let pid = child.id().unwrap_or(0);
        // A real backend would keep a handle to the running process; for
        // the local backend we take the simplest correct path and wait
        // for completion inline, reporting it as already-done on the
        // first poll.
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;

        let stdout_path = PathBuf::from(&bound.call_root).join("stdout");
        let stderr_path = PathBuf::from(&bound.call_root).join("stderr");
        let mut stdout_file = tokio::fs::File::create(&stdout_path)
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;
        stdout_file
            .write_all(&output.stdout)
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;
        let mut stderr_file = tokio::fs::File::create(&stderr_path)
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;
        stderr_file
            .write_all(&output.stderr)
            .await
            .map_err(|e| BackendError::Dispatch(e.to_string()))?;

        let return_code_path = PathBuf::from(&bound.call_root).join("returnCode");
        tokio::fs::write(
            &return_code_path,
            output.status.code().map(|c| c.to_string()).unwrap_or_default(),
        )
        .await
        .map_err(|e| BackendError::Dispatch(e.to_string()))?;

        Ok(ExecutionHandle(serde_json::json!({
            "pid": pid,
            "return_code": output.status.code(),
            "stderr_size": output.stderr.len() as u64,
        })))
    }

    async fn resume(
        &self,
        _bound: &BoundCall,
        _resume_token: &str,
    ) -> Result<ExecutionHandle, BackendError> {
        Err(BackendError::Dispatch(
            "local backend cannot resume across a restart".into(),
        ))
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<PollOutcome, BackendError> {
        let return_code = handle.0.get("return_code").and_then(|v| v.as_i64());
        let stderr_size = handle
            .0
            .get("stderr_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let detail = CallOutcomeDetail {
            return_code: return_code.map(|c| c as i32),
            stderr_size,
            outputs: serde_json::Map::new(),
            events: vec![],
        };
        match return_code {
            Some(0) => Ok(PollOutcome::Succeeded(detail)),
            Some(_) => Ok(PollOutcome::Failed {
                detail,
                error_code: "nonzero_return_code".into(),
                message: "command exited with a nonzero return code".into(),
                retryability_hint: RetryabilityHint::NonRetryable,
            }),
            None => Ok(PollOutcome::Failed {
                detail,
                error_code: "undefined_return_code".into(),
                message: "return code file missing or unparsable".into(),
                retryability_hint: RetryabilityHint::Retryable,
            }),
        }
    }

    async fn abort(&self, _handle: &ExecutionHandle) -> Result<(), BackendError> {
        Ok(())
    }

    async fn copy_cache_hit(
        &self,
        bound: &BoundCall,
        prior: &PriorResult,
        strategy: HitStrategy,
    ) -> Result<serde_json::Map<String, serde_json::Value>, BackendError> {
        match strategy {
            HitStrategy::UseOriginal => {
                let placeholder = PathBuf::from(&bound.call_root).join("call-cache-hit.txt");
                tokio::fs::write(
                    &placeholder,
                    format!("cache hit: outputs point at {}\n", prior.call_root),
                )
                .await
                .map_err(|e| BackendError::Dispatch(e.to_string()))?;
                Ok(prior.outputs.clone())
            }
            HitStrategy::CopyOutputs => {
                let mut new_outputs = serde_json::Map::new();
                for (key, value) in &prior.outputs {
                    if let Some(src) = value.as_str() {
                        let file_name = PathBuf::from(src)
                            .file_name()
                            .map(|f| f.to_string_lossy().to_string())
                            .unwrap_or_else(|| key.clone());
                        let dst = PathBuf::from(&bound.call_root).join(&file_name);
                        tokio::fs::copy(src, &dst)
                            .await
                            .map_err(|e| BackendError::Dispatch(e.to_string()))?;
                        new_outputs.insert(
                            key.clone(),
                            serde_json::Value::String(dst.to_string_lossy().to_string()),
                        );
                    } else {
                        new_outputs.insert(key.clone(), value.clone());
                    }
                }

                // Bring the prior attempt's script/stdout/stderr/returnCode
                // along too, under their conventional basenames, so a
                // cache-hit call root looks the same as a freshly-executed
                // one (spec.md §4.C).
                for name in crate::call::CONVENTIONAL_DETRITUS_NAMES {
                    if let Some(src) = prior
                        .detritus_paths
                        .iter()
                        .find(|p| PathBuf::from(p).file_name().map(|f| f == *name).unwrap_or(false))
                    {
                        let dst = PathBuf::from(&bound.call_root).join(name);
                        if let Err(e) = tokio::fs::copy(src, &dst).await {
                            tracing::debug!(src, error = %e, "skipping missing detritus file on cache hit");
                        }
                    }
                }
                Ok(new_outputs)
            }
        }
    }

    async fn cleanup_workflow(
        &self,
        _workflow: &Workflow,
        _init_data: &InitData,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}
