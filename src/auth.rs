use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::RoomState;

/// The acting user, resolved once per connection from the pgwire startup
/// `user` parameter and the configured admin list.
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub is_admin: bool,
}

/// Per-room capability pair for transition guards.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub is_admin: bool,
    /// True when this actor may decide the room's pending bookings: the
    /// room's designated approver, or any admin when no approver is set.
    pub is_approver: bool,
}

impl Actor {
    pub fn resolve(name: impl Into<String>, admins: &HashSet<String>) -> Self {
        let name = name.into();
        let is_admin = admins.contains(&name);
        Self { name, is_admin }
    }

    pub fn capabilities_for(&self, room: &RoomState) -> Capabilities {
        let is_approver = match &room.approver {
            Some(approver) => approver == &self.name,
            None => self.is_admin,
        };
        Capabilities {
            is_admin: self.is_admin,
            is_approver,
        }
    }
}

#[derive(Debug)]
pub struct QuorumAuthSource {
    password: String,
}

impl QuorumAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for QuorumAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
