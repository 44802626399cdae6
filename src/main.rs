use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use email_llm::channels::{IdleNotifier, ImapMailbox, PollingScheduler, Relay, SmtpRelay};
use email_llm::config::{ForwarderConfig, TriggerMode};
use email_llm::llm::create_provider;
use email_llm::logging;
use email_llm::pipeline::{ContentTransformer, Forwarder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    dotenvy::dotenv().ok();

    let config = ForwarderConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = logging::init_tracing(&config.log).context("Failed to initialise logging")?;

    info!("Email LLM forwarder v{}", env!("CARGO_PKG_VERSION"));
    info!(
        source = %config.mailbox.username,
        host = %config.mailbox.host,
        folder = %config.mailbox.folder,
        target = %config.relay.destination,
        trigger = ?config.scheduler.trigger,
        "Configuration loaded"
    );

    let provider = create_provider(&config.transform).context("Failed to create LLM provider")?;
    if provider.is_none() {
        info!("LLM rewrite disabled, messages are forwarded unchanged");
    }
    let transformer = ContentTransformer::new(
        provider,
        config.transform.prompt.clone(),
        config.transform.timeout,
    );

    let relay: Arc<dyn Relay> = Arc::new(SmtpRelay::new(config.relay.clone()));
    // Returning lets `_log_guard` flush the file writer.
    verify_relay(relay.as_ref()).await?;

    let handler = Arc::new(Forwarder::new(
        transformer,
        Arc::clone(&relay),
        config.scheduler.forward_marker.clone(),
    ));
    let mailbox = Box::new(ImapMailbox::new(config.mailbox.clone()));

    let worker = match config.scheduler.trigger {
        TriggerMode::Poll => PollingScheduler::new(
            mailbox,
            handler,
            config.mailbox.folder.clone(),
            config.scheduler.check_interval,
        )
        .spawn(),
        TriggerMode::Idle => IdleNotifier::new(
            mailbox,
            handler,
            config.mailbox.folder.clone(),
            config.scheduler.idle_timeout,
            config.scheduler.reconnect_delay,
        )
        .spawn(),
    };

    wait_for_shutdown().await;
    info!("Shutdown requested, finishing in-flight message");
    worker.stop();
    worker.join().await;
    info!("Forwarder stopped");
    Ok(())
}

async fn verify_relay(relay: &dyn Relay) -> anyhow::Result<()> {
    if let Err(e) = relay.test_connection().await {
        error!("SMTP connection test failed, exiting: {e}");
        return Err(e).context("SMTP connection test failed");
    }
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use email_llm::channels::OutboundMessage;
    use email_llm::error::RelayError;

    use super::*;

    struct UnreachableRelay;

    #[async_trait]
    impl Relay for UnreachableRelay {
        async fn send(&self, _outbound: &OutboundMessage) -> Result<(), RelayError> {
            unreachable!("nothing is sent before the relay is verified")
        }

        async fn test_connection(&self) -> Result<(), RelayError> {
            Err(RelayError::Connect {
                host: "smtp.example.com".into(),
                port: 465,
                reason: "connection refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn failed_relay_check_is_returned_not_exited() {
        let err = verify_relay(&UnreachableRelay).await.unwrap_err();
        assert_eq!(err.to_string(), "SMTP connection test failed");
        assert!(err.root_cause().to_string().contains("connection refused"));
    }
}
