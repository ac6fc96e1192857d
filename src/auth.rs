use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every dispatcher client; the user name is
/// logged but not checked.
#[derive(Debug)]
pub struct FuhrparkAuthSource {
    password: String,
}

impl FuhrparkAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FuhrparkAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("login attempt by {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
