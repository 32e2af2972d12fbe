//! # Entity 模块
//!
//! 包含所有 Sea-ORM 实体定义

pub mod quota_accounts;

pub use quota_accounts::Entity as QuotaAccounts;

#[cfg(test)]
mod tests;
