//! Operator tool for confidential events.
use std::{process, sync::Arc};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use oasis_confidential_events::{
    config::{Action, Config},
    logger::{self, get_logger},
    session::{DecryptedEvent, Session},
    transport::jsonrpc::JsonRpcTransport,
};

async fn run(cfg: Config, logger: &slog::Logger) -> Result<()> {
    let transport = Arc::new(JsonRpcTransport::new(
        &cfg.rpc_url,
        cfg.from,
        cfg.poll_interval,
    )?);
    let mut session = Session::new(transport, cfg.agreement, cfg.contract, cfg.options);

    match cfg.action {
        Action::Emit { message } => {
            let outcome = session.emit(&message).await?;
            println!("transaction: {:?}", outcome.transaction);
            println!("{}", outcome.key_material());
        }
        Action::Decrypt { transaction } => {
            for event in session.decrypt(transaction).await? {
                println!("{event}");
            }
        }
        Action::Listen => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            let signal_logger = logger.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        slog::info!(signal_logger, "interrupted, stopping");
                        on_signal.cancel();
                    }
                    Err(err) => {
                        slog::warn!(signal_logger, "failed to install interrupt handler"; "err" => %err);
                    }
                }
            });

            let summary = session
                .listen(cancel, |event: &DecryptedEvent| println!("{event}"))
                .await?;
            slog::info!(logger, "listen finished";
                "delivered" => summary.delivered,
                "decrypted" => summary.decrypted,
                "failed" => summary.failed,
                "mismatch_reported" => summary.mismatch_reported,
                "auth_failures_reported" => summary.auth_failures_reported,
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err:#}");
            process::exit(2);
        }
    };
    logger::init(cfg.log_level);
    let logger = get_logger("main");

    if let Err(err) = run(cfg, &logger).await {
        slog::error!(logger, "action failed"; "err" => format!("{err:#}"));
        process::exit(1);
    }
}
