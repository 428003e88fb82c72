#[macro_use]
extern crate lazy_static;

mod config;
mod error;
mod forwarder;
mod gateway;
mod repository;
mod scheduler;
mod supervisor;
mod topology;

use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use log::info;
use sqlx::mysql::MySqlPool;

use crate::error::{classify_sqlx_error, RuntimeError};
use crate::repository::mysql::MySqlRepository;
use crate::repository::Repository;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<(), RuntimeError> {
    env_logger::init();
    dotenv().ok();

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| RuntimeError::Configuration("missing DATABASE_URL from environment".to_string()))?;
    let pool = MySqlPool::connect(&database_url).await.map_err(classify_sqlx_error)?;

    let repo: Arc<dyn Repository> = Arc::new(MySqlRepository::new(pool));
    let supervisor = Arc::new(Supervisor::new(repo));

    supervisor.start().await;
    info!("bot runtime started; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping runtime");

    supervisor.stop().await;

    Ok(())
}
