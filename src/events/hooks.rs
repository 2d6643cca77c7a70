use std::{process::Stdio, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    config::{self, CONFIG},
    db::{Db, HookDefinition},
};

use super::Event;

/// Run every enabled hook subscribed to the event. The JSON payload goes to
/// the command's stdin and the flattened payload is exported as `SUBLARR_*`
/// environment variables.
pub async fn dispatch(db: &Db, event: &Event) {
    let hooks = match db.list_hooks().await {
        Ok(hooks) => hooks,
        Err(e) => {
            tracing::error!("Failed to load hooks: {e}");
            return;
        }
    };
    for hook in hooks {
        if !hook.enabled || !hook.subscribes_to(event.name()) {
            continue;
        }
        execute(db, &hook, event).await;
    }
}

async fn execute(db: &Db, hook: &HookDefinition, event: &Event) {
    let timeout: config::HookTimeoutSeconds = CONFIG.get_value();
    let payload = event.payload();
    let payload_json = serde_json::Value::Object(payload.clone()).to_string();

    let mut command = shell_command(&hook.command);
    command
        .env("SUBLARR_EVENT", event.name())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &payload {
        let env_value = match value {
            serde_json::Value::String(s) => s.clone(),
            rest => rest.to_string(),
        };
        command.env(format!("SUBLARR_{}", key.to_uppercase()), env_value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(hook = %hook.name, "Failed to spawn hook: {e}");
            let _ = db
                .record_hook_run(hook.id, event.name(), None, "", &e.to_string())
                .await;
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(payload_json.as_bytes()).await;
    }

    let output = tokio::time::timeout(
        Duration::from_secs(timeout.0),
        child.wait_with_output(),
    )
    .await;
    let (exit_code, stdout, stderr) = match output {
        Ok(Ok(output)) => (
            output.status.code().map(|c| c as i64),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ),
        Ok(Err(e)) => {
            tracing::error!(hook = %hook.name, "Hook execution failed: {e}");
            (None, String::new(), e.to_string())
        }
        Err(_) => {
            tracing::warn!(hook = %hook.name, "Hook timed out after {}s", timeout.0);
            (None, String::new(), format!("timed out after {}s", timeout.0))
        }
    };

    if let Err(e) = db
        .record_hook_run(hook.id, event.name(), exit_code, &stdout, &stderr)
        .await
    {
        tracing::error!("Failed to record hook run: {e}");
    }
}

fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.args(["/C", command_line]);
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.args(["-c", command_line]);
        command
    }
}

/// One-off execution for the hook test endpoint; returns the captured
/// output without consulting filters.
pub async fn test_hook(db: &Db, hook_id: i64) -> Result<(), crate::app_state::AppError> {
    let hook = db.get_hook(hook_id).await?;
    let event = Event::ConfigUpdated {
        keys: vec!["test".to_string()],
    };
    execute(db, &hook, &event).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn test_db() -> Db {
        let db = Db::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_receives_payload_env_and_logs_output() {
        let db = test_db().await;
        let id = db
            .upsert_hook(None, "echo", "[]", "echo \"got $SUBLARR_EVENT\"", true)
            .await
            .unwrap();
        let event = Event::ScanStarted {
            instance: "standalone".into(),
        };
        dispatch(&db, &event).await;
        let logs = db.list_hook_logs(Some(id)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].exit_code, Some(0));
        assert!(logs[0].stdout.contains("got scan_started"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disabled_hooks_are_skipped() {
        let db = test_db().await;
        let id = db
            .upsert_hook(None, "off", "[]", "echo hi", false)
            .await
            .unwrap();
        dispatch(
            &db,
            &Event::ScanStarted {
                instance: "x".into(),
            },
        )
        .await;
        assert!(db.list_hook_logs(Some(id)).await.unwrap().is_empty());
    }
}
