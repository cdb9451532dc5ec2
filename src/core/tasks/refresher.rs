// src/core/tasks/refresher.rs

//! The renew-before-expiry loop that keeps one authorized audience alive.
//!
//! One refresher exists per authorized session or link; its lifetime is
//! tied to the object it authorizes. Cancellation is cooperative and
//! checked at every loop boundary.

use crate::config::TokenConfig;
use crate::core::errors::HubMuxError;
use crate::core::transport::{SessionHandle, TokenRequest, TokenSender};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct TokenRefresher {
    session: SessionHandle,
    sender: Arc<dyn TokenSender>,
    request: TokenRequest,
    config: TokenConfig,
    cancel: CancellationToken,
}

impl TokenRefresher {
    pub fn new(
        session: SessionHandle,
        sender: Arc<dyn TokenSender>,
        request: TokenRequest,
        config: TokenConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            sender,
            request,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn audience(&self) -> &str {
        &self.request.audience
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends the first token for this audience and, on success, spawns the
    /// background renewal loop. A caller's link open proceeds only after
    /// this send has completed.
    pub async fn send_initial_token(self: &Arc<Self>, timeout: Duration) -> Result<(), HubMuxError> {
        let expires_at = self
            .sender
            .send_token(&self.session, &self.request, timeout)
            .await?;
        debug!(audience = %self.request.audience, ?expires_at, "initial token sent");
        self.clone().spawn_renewal_loop(expires_at);
        Ok(())
    }

    /// Delay until the renewal instant for `expires_at`, or `None` when no
    /// renewal is needed (the token never expires) or possible (the instant
    /// is already past).
    fn renew_delay(&self, expires_at: Option<DateTime<Utc>>) -> Option<Duration> {
        let expires_at = expires_at?;
        let buffer = chrono::Duration::from_std(self.config.refresh_buffer).ok()?;
        (expires_at - buffer - Utc::now())
            .to_std()
            .ok()
            .filter(|delay| !delay.is_zero())
    }

    fn spawn_renewal_loop(self: Arc<Self>, expires_at: Option<DateTime<Utc>>) {
        let Some(mut delay) = self.renew_delay(expires_at) else {
            debug!(audience = %self.request.audience, "no renewal scheduled");
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.renew_once().await {
                    Some(next) => delay = next,
                    None => return,
                }
            }
        });
    }

    /// One renewal: resend the token, retrying non-fatal failures at a
    /// fixed interval, with no backoff and no retry cap. Returns the delay
    /// to the next renewal, or `None` when the loop should stop.
    async fn renew_once(&self) -> Option<Duration> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if !self.session.is_open() {
                debug!(audience = %self.request.audience, "session closing; renewal loop stopping");
                return None;
            }
            match self
                .sender
                .send_token(&self.session, &self.request, self.config.operation_timeout)
                .await
            {
                Ok(expires_at) => {
                    debug!(audience = %self.request.audience, ?expires_at, "token renewed");
                    return self.renew_delay(expires_at);
                }
                Err(err) if err.is_fatal() => {
                    error!(audience = %self.request.audience, %err, "fatal error renewing token");
                    return None;
                }
                Err(err) => {
                    warn!(
                        audience = %self.request.audience,
                        %err,
                        retry_in = ?self.config.retry_interval,
                        "token renewal failed; will retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                }
            }
        }
    }
}
