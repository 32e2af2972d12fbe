//! # 数据库模块
//!
//! 额度账本持久层的连接和迁移管理

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

use crate::config::DatabaseConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo, lwarn};

/// 按配置建立连接池
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let url = config.get_connection_url()?;
    let display_url: String = url.chars().take(50).collect();
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "connect_database",
        "正在连接数据库",
        url = %display_url,
        max_connections = config.max_connections,
    );

    let mut options = ConnectOptions::new(url);
    options
        .max_connections(config.max_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .acquire_timeout(Duration::from_secs(config.query_timeout))
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .map_err(|e| ProxyError::database_with_source("数据库连接失败", e))?;

    linfo!("system", LogStage::Startup, LogComponent::Database, "database_connected", "数据库连接成功");
    Ok(db)
}

/// 运行数据库迁移
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    linfo!("system", LogStage::Startup, LogComponent::Database, "run_migrations", "开始运行数据库迁移");

    match ::migration::Migrator::up(db, None).await {
        Ok(()) => {
            linfo!("system", LogStage::Startup, LogComponent::Database, "migrations_done", "数据库迁移完成");
            Ok(())
        }
        Err(e) => {
            lerror!("system", LogStage::Startup, LogComponent::Database, "migrations_failed", "数据库迁移失败", error = %e);
            Err(ProxyError::database_with_source("数据库迁移失败", e))
        }
    }
}

/// 检查是否有未应用的迁移
pub async fn check_database_status(db: &DatabaseConnection) -> Result<usize> {
    let pending = ::migration::Migrator::get_pending_migrations(db).await?;

    if pending.is_empty() {
        linfo!("system", LogStage::Startup, LogComponent::Database, "migration_status", "所有迁移都已应用");
    } else {
        lwarn!("system", LogStage::Startup, LogComponent::Database, "migration_status", "存在待应用的迁移", pending = pending.len());
    }

    Ok(pending.len())
}
