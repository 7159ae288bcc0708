//! Fires a configured external command after a successful upload (spec
//! §4.5 step 4, §6.4).
//!
//! Grounded on `original_source/tsdfileapi/api.py`'s call site for
//! `call_request_hook`: invoked as `<hook_path> <final_path> <user>
//! <api_user> <group>`, fire-and-forget — the core neither waits for nor
//! surfaces its result, only logs a failure to spawn or a non-zero exit.

use std::path::Path;

use tokio::process::Command;

/// Spawns `hook_path` with the standard argument order, detached from the
/// request's lifetime. Failures are logged, never propagated.
pub fn invoke(hook_path: &Path, final_path: &Path, user: &str, api_user: &str, group: &str) {
    let hook_path = hook_path.to_owned();
    let final_path = final_path.to_owned();
    let user = user.to_owned();
    let api_user = api_user.to_owned();
    let group = group.to_owned();

    tokio::spawn(async move {
        let result = Command::new(&hook_path)
            .arg(&final_path)
            .arg(&user)
            .arg(&api_user)
            .arg(&group)
            .status()
            .await;

        match result {
            Ok(status) if status.success() => {
                tracing::debug!(hook = %hook_path.display(), "request hook completed");
            }
            Ok(status) => {
                tracing::warn!(hook = %hook_path.display(), %status, "request hook exited non-zero");
            }
            Err(e) => {
                tracing::warn!(hook = %hook_path.display(), error = %e, "failed to spawn request hook");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_invoke_does_not_panic_on_missing_binary() {
        invoke(
            &PathBuf::from("/nonexistent/hook-binary"),
            &PathBuf::from("/tmp/x.bin"),
            "user",
            "api",
            "p11-member-group",
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
