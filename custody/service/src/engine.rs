// Copyright (c) 2024 The Botho Foundation

//! Custody engine - follows the chain and reconciles withdrawals.

use bth_custody_core::ScannerSettings;
use futures::{stream, StreamExt};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    scanner::DepositCandidate,
    service::CustodyService,
};

/// Shutdown signal type.
pub type ShutdownSignal = broadcast::Receiver<()>;

/// Upper bound on blocks credited in one catch-up pass.
const MAX_BLOCKS_PER_PASS: u64 = 500;

/// The long-running custody process.
pub struct CustodyEngine {
    service: Arc<CustodyService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CustodyEngine {
    pub fn new(service: Arc<CustodyService>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            service,
            shutdown_tx,
        }
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Run until `stop` completes.
    pub async fn run_until<F: Future<Output = ()>>(self, stop: F) -> Result<()> {
        info!("Starting custody engine");

        let follower = ChainFollower::new(self.service.clone());
        let follow_shutdown = self.shutdown_tx.subscribe();
        let follow_handle = tokio::spawn(async move {
            follower.run(follow_shutdown).await;
        });

        let service = self.service.clone();
        let interval = Duration::from_secs(service.config().withdrawal.reconcile_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reconcile_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Reconciler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match service.reconcile().await {
                            Ok(report) if report.examined > 0 => {
                                info!(
                                    "Reconciled {} pending withdrawals: {} confirmed, {} failed, {} pending ({} rebroadcast)",
                                    report.examined,
                                    report.confirmed,
                                    report.failed,
                                    report.pending,
                                    report.rebroadcast
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("Reconciliation error: {}", e),
                        }
                    }
                }
            }
        });

        stop.await;

        // Send shutdown signal to all components
        let _ = self.shutdown_tx.send(());

        // Wait for all components to finish
        let _ = tokio::join!(follow_handle, reconcile_handle);

        info!("Custody engine stopped");
        Ok(())
    }
}

/// Scans finalized blocks in order, crediting deposits and advancing the cursor.
pub struct ChainFollower {
    service: Arc<CustodyService>,
    settings: ScannerSettings,
}

impl ChainFollower {
    pub fn new(service: Arc<CustodyService>) -> Self {
        let settings = service.config().scanner.clone();
        Self { service, settings }
    }

    async fn run(self, mut shutdown: ShutdownSignal) {
        info!(
            "Following chain from block {}",
            self.next_block().map(|b| b.to_string()).unwrap_or_else(|e| e.to_string())
        );
        let poll = Duration::from_secs(self.settings.poll_interval_secs);

        loop {
            let idle = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Chain follower shutting down");
                    return;
                }
                result = self.catch_up() => match result {
                    Ok(0) => true,
                    Ok(processed) => {
                        debug!("Processed {} blocks", processed);
                        false
                    }
                    Err(e) => {
                        warn!("Scan pass stopped: {}", e);
                        true
                    }
                },
            };

            if idle {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Chain follower shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }

    fn next_block(&self) -> Result<u64> {
        Ok(match self.service.ledger().scan_cursor()? {
            Some(cursor) => cursor + 1,
            None => self.settings.start_block,
        })
    }

    /// Process every finalized block after the cursor; returns how many were processed.
    ///
    /// Blocks are fetched concurrently but credited, and the cursor advanced,
    /// strictly in block order. A block that keeps failing stops the pass
    /// with the cursor just before it.
    pub async fn catch_up(&self) -> Result<u64> {
        let Some(finalized) = self.service.scanner().finalized_head().await? else {
            return Ok(0);
        };

        let start = self.next_block()?;
        if start > finalized {
            return Ok(0);
        }
        let end = finalized.min(start.saturating_add(MAX_BLOCKS_PER_PASS - 1));

        let mut blocks = stream::iter(start..=end)
            .map(|number| async move { (number, self.fetch_candidates(number).await) })
            .buffered(self.settings.max_parallel_blocks.max(1));

        let mut processed = 0;
        while let Some((number, candidates)) = blocks.next().await {
            let candidates = candidates?;
            self.service.credit_candidates(number, &candidates)?;
            self.service.ledger().advance_scan_cursor(number)?;
            processed += 1;
        }

        Ok(processed)
    }

    /// Fetch and classify one block, retrying transient failures with linear backoff.
    async fn fetch_candidates(&self, number: u64) -> Result<Vec<DepositCandidate>> {
        let scanner = self.service.scanner();
        let mut attempt = 0;

        loop {
            let result = match scanner.fetch(number).await {
                Ok(block) => scanner.candidates(&block),
                Err(e) => Err(e),
            };

            match result {
                Ok(candidates) => return Ok(candidates),
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    warn!(
                        "Block {} fetch failed (attempt {}/{}): {}",
                        number, attempt, self.settings.max_retries, e
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.settings.retry_backoff_secs * u64::from(attempt),
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
