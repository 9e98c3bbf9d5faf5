//! The interface remote front ends drive the engine through.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::Engine;
use crate::error::CommandError;
use crate::output::CommandOutput;
use crate::users::UserConnections;

/// What a gateway needs from the engine: run a command line, and resolve
/// which instances belong to which user.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn execute(&self, line: &str) -> Result<CommandOutput, CommandError>;

    async fn generate_users_conns(&self, config: &str) -> Result<Arc<UserConnections>, CommandError>;
}

#[async_trait]
impl EngineHandle for Engine {
    async fn execute(&self, line: &str) -> Result<CommandOutput, CommandError> {
        Engine::execute(self, line).await
    }

    async fn generate_users_conns(&self, config: &str) -> Result<Arc<UserConnections>, CommandError> {
        Engine::generate_users_conns(self, config, None)
    }
}
