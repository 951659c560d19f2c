//! Tunables for the core. Defaults match the values named explicitly in the
//! component design; everything else is a deliberate, documented choice.

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum number of skipped message keys the ratchet will derive ahead
    /// of the current chain position before refusing with `TooManySkipped`.
    pub skip_window: u32,
    /// Pending-vault-put retry backoff base, in seconds.
    pub vault_put_retry_base_secs: u64,
    /// Pending-vault-put retry attempt ceiling.
    pub vault_put_max_attempts: u32,
    /// Debounce window for coalescing server catch-up jobs per conversation.
    pub catchup_debounce_secs: u64,
    /// Page size for `listSecureMessages` during catch-up.
    pub catchup_page_size: u32,
    /// Consecutive hard send failures before `sendFailureCounter` trips.
    pub send_failure_trip_threshold: u32,
    /// Default master-key auto-lock timeout, in seconds. 0 disables auto-lock.
    pub auto_lock_secs: u64,
    /// Number of consecutive successful sends before a contact-secrets
    /// backup blob is opportunistically attached to an outbound send.
    pub backup_attach_every_n_sends: u32,
    /// Bound on the per-conversation processed-message dedup cache.
    pub processed_cache_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            skip_window: 1024,
            vault_put_retry_base_secs: 60,
            vault_put_max_attempts: 5,
            catchup_debounce_secs: 2,
            catchup_page_size: 200,
            send_failure_trip_threshold: 3,
            auto_lock_secs: 1800,
            backup_attach_every_n_sends: 20,
            processed_cache_capacity: 2048,
        }
    }
}
