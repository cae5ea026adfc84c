//! Request-level protections: CSRF, CSP nonces, rate limiting and the rich
//! text sanitization gate.

pub mod csp;
pub mod csrf;
pub mod rate_limit;
pub mod sanitize;
