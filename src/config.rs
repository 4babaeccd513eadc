use crate::useragent::dtmf::DtmfMode;
use std::time::Duration;

/// Tuning knobs for the user agent. Every timeout the stack applies is
/// carried here so embedders can shorten them in tests or constrained
/// networks.
#[derive(Clone, Debug)]
pub struct UserAgentConfig {
    pub user_agent: String,

    /// Final-response timeout for INVITE client transactions.
    pub invite_timeout: Duration,
    /// Final-response timeout for REGISTER and in-dialog client transactions.
    pub request_timeout: Duration,
    /// Upper bound on a single transport write.
    pub transport_write_timeout: Duration,

    /// Requested registration lifetime; the server may shorten it.
    pub register_expires: u32,
    /// First retry delay after a failed REGISTER.
    pub register_retry_base: Duration,
    /// Retry delay ceiling.
    pub register_retry_cap: Duration,

    /// Tone length used when a DTMF request does not carry one.
    pub dtmf_duration: Duration,
    /// Silence inserted between queued digits.
    pub dtmf_inter_digit_gap: Duration,
    pub dtmf_mode: DtmfMode,

    /// How long a terminated call stays in the store to absorb late
    /// BYE/ACK retransmissions.
    pub terminal_linger: Duration,
    /// Bound on best-effort BYEs during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        UserAgentConfig {
            user_agent: concat!("sipua/", env!("CARGO_PKG_VERSION")).to_string(),
            invite_timeout: Duration::from_secs(180),
            request_timeout: Duration::from_secs(32),
            transport_write_timeout: Duration::from_secs(10),
            register_expires: 3600,
            register_retry_base: Duration::from_secs(2),
            register_retry_cap: Duration::from_secs(300),
            dtmf_duration: Duration::from_millis(160),
            dtmf_inter_digit_gap: Duration::from_millis(40),
            dtmf_mode: DtmfMode::Info,
            terminal_linger: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl UserAgentConfig {
    /// Timeout applied to a client transaction of the given method.
    pub fn transaction_timeout(&self, method: &rsip::Method) -> Duration {
        match method {
            rsip::Method::Invite => self.invite_timeout,
            _ => self.request_timeout,
        }
    }
}
