use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::config::Config;
use crate::engine::Authority;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// May run the approval workflow.
    Authority(Authority),
    /// Any other login; books under its own user name.
    Requester(String),
}

impl Actor {
    pub fn authority(&self) -> Option<&Authority> {
        match self {
            Actor::Authority(a) => Some(a),
            Actor::Requester(_) => None,
        }
    }
}

/// Passwords per login: authority users share one, everyone else another.
/// Without an authority password, authority logins are refused.
#[derive(Debug, Clone)]
pub struct SlotwiseAuthSource {
    password: String,
    authority_users: Vec<String>,
    authority_password: Option<String>,
}

impl SlotwiseAuthSource {
    pub fn new(config: &Config) -> Self {
        Self {
            password: config.password.clone(),
            authority_users: config.authority_users.clone(),
            authority_password: config.authority_password.clone(),
        }
    }

    pub fn is_authority(&self, user: &str) -> bool {
        self.authority_users.iter().any(|u| u == user)
    }

    /// Classify an authenticated login.
    pub fn actor(&self, user: &str) -> Actor {
        if self.is_authority(user) {
            Actor::Authority(Authority::new(user))
        } else {
            Actor::Requester(user.to_string())
        }
    }

    /// `None` when the login may not authenticate at all.
    fn password_for(&self, user: Option<&str>) -> Option<&str> {
        match user {
            Some(u) if self.is_authority(u) => self.authority_password.as_deref(),
            _ => Some(&self.password),
        }
    }
}

#[async_trait]
impl AuthSource for SlotwiseAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(password) = self.password_for(login.user()) else {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "authority logins are disabled on this server".into(),
            ))));
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SlotwiseAuthSource {
        SlotwiseAuthSource::new(&Config {
            password: "student-pw".into(),
            authority_users: vec!["admin".into()],
            authority_password: Some("admin-pw".into()),
            ..Config::default()
        })
    }

    #[test]
    fn authority_users_get_their_own_password() {
        let s = source();
        assert_eq!(s.password_for(Some("admin")), Some("admin-pw"));
        assert_eq!(s.password_for(Some("s1")), Some("student-pw"));
        assert_eq!(s.password_for(None), Some("student-pw"));
    }

    #[test]
    fn authority_login_refused_without_its_password() {
        let s = SlotwiseAuthSource::new(&Config {
            password: "student-pw".into(),
            ..Config::default()
        });
        assert_eq!(s.password_for(Some("admin")), None);
        assert_eq!(s.password_for(Some("s1")), Some("student-pw"));
    }

    #[test]
    fn actors() {
        let s = source();
        assert_eq!(s.actor("admin").authority().map(Authority::name), Some("admin"));
        assert_eq!(s.actor("s1"), Actor::Requester("s1".into()));
        assert!(s.actor("s1").authority().is_none());
    }
}
