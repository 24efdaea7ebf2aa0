use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::observability;

/// Shared-password login. The user name becomes the actor id for every
/// booking and cancellation on the connection.
#[derive(Debug)]
pub struct WashslotAuthSource {
    password: String,
}

impl WashslotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for WashslotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if login.user().is_none_or(str::is_empty) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
