//! `sprintsync sync` command: reconcile a plan against the tracker.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use sprintsync_core::{MemoryTracker, TrackerClient, parse, run_sync, summarize};

use crate::config::ResolvedConfig;
use crate::gh::GhTracker;
use crate::report;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub json: bool,
}

fn build_tracker(config: &ResolvedConfig, dry_run: bool) -> Result<Arc<dyn TrackerClient>> {
    if dry_run {
        tracing::info!("dry run: using in-memory tracker");
        return Ok(Arc::new(MemoryTracker::new()));
    }

    let sync = &config.sync;
    if sync.organization.is_empty() || sync.repository.is_empty() {
        bail!(
            "no repository configured; pass --repo owner/name, set SPRINTSYNC_REPOSITORY, \
             or run `sprintsync init`"
        );
    }
    if sync.add_to_board && config.board.is_none() {
        bail!("add_to_board is set but the config file has no [board] section");
    }
    Ok(Arc::new(GhTracker::new(
        sync.organization.clone(),
        sync.repository.clone(),
        config.board.clone(),
    )))
}

/// First Ctrl+C cancels the run, a second one exits immediately.
fn install_signal_handler(cancel: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nStopping after in-flight calls (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}

/// Run the sync command. Returns the process exit code.
pub async fn run_sync_command(
    path: &Path,
    config: &ResolvedConfig,
    options: SyncOptions,
) -> Result<i32> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    let plan = match parse(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return Ok(1);
        }
    };
    for warning in &plan.warnings {
        tracing::warn!(%warning, "plan warning");
    }

    tracing::info!(
        plan = %path.display(),
        config = ?config.source,
        dry_run = options.dry_run,
        "starting sync"
    );
    let tracker = build_tracker(config, options.dry_run)?;
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    let report = match run_sync(&plan, tracker, &config.sync, cancel).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return Ok(1);
        }
    };
    let summary = summarize(&report);

    if options.json {
        println!("{}", report::render_json(&summary)?);
    } else {
        if options.dry_run {
            println!("(dry run: nothing was sent to the tracker)\n");
        }
        print!("{}", report::render_table(&summary));
    }
    Ok(summary.exit_code())
}

#[cfg(test)]
mod tests {
    use sprintsync_core::SyncConfig;
    use sprintsync_test_utils::TWO_SPRINT_PLAN;

    use super::*;
    use crate::config::BoardSection;

    fn resolved(sync: SyncConfig) -> ResolvedConfig {
        ResolvedConfig {
            sync,
            board: None,
            source: None,
        }
    }

    #[test]
    fn real_run_requires_repository() {
        let err = build_tracker(&resolved(SyncConfig::default()), false)
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("no repository configured"));
    }

    #[test]
    fn board_placement_requires_board_section() {
        let cfg = resolved(SyncConfig {
            organization: "acme".into(),
            repository: "roadmap".into(),
            add_to_board: true,
            ..SyncConfig::default()
        });
        let err = build_tracker(&cfg, false).err().expect("should fail");
        assert!(err.to_string().contains("[board]"));

        let mut cfg = cfg;
        cfg.board = Some(BoardSection {
            project_number: 1,
            project_id: "PVT".into(),
            status_field_id: "F".into(),
            todo_option_id: "O".into(),
        });
        assert!(build_tracker(&cfg, false).is_ok());
    }

    #[tokio::test]
    async fn dry_run_syncs_fixture_cleanly() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("plan.md");
        std::fs::write(&path, TWO_SPRINT_PLAN).unwrap();

        let mut cfg = sprintsync_test_utils::fast_config();
        cfg.organization.clear();
        let options = SyncOptions {
            dry_run: true,
            json: true,
        };
        let code = run_sync_command(&path, &resolved(cfg), options).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn invalid_plan_exits_with_one() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("plan.md");
        std::fs::write(&path, "no sprints\n").unwrap();

        let options = SyncOptions {
            dry_run: true,
            json: false,
        };
        let code = run_sync_command(&path, &resolved(SyncConfig::default()), options)
            .await
            .unwrap();
        assert_eq!(code, 1);
    }
}
