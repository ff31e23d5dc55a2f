use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every organization; the database name picks the tenant.
#[derive(Debug)]
pub struct TurnstileAuthSource {
    password: String,
}

impl TurnstileAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TurnstileAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password login for database {:?}", login.database());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
