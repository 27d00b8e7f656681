//! Payloads of the actions the system account handles natively.

use super::authority::Authority;
use crate::error::{ChainError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared_types::{system_account, AccountName, Action, BlockHeader, PermissionLevel, TransactionId};

pub trait SystemAction: Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn to_action(&self, authorization: Vec<PermissionLevel>) -> Action {
        Action {
            account: system_account(),
            name: AccountName::new(Self::NAME),
            authorization,
            data: bincode::serialize(self).unwrap_or_default(),
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| ChainError::ActionValidate(format!("malformed {} payload: {e}", Self::NAME)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub creator: AccountName,
    pub name: AccountName,
    pub owner: Authority,
    pub active: Authority,
}

impl SystemAction for NewAccount {
    const NAME: &'static str = "newaccount";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCode {
    pub account: AccountName,
    /// Empty clears the contract.
    pub code: Vec<u8>,
}

impl SystemAction for SetCode {
    const NAME: &'static str = "setcode";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAuth {
    pub account: AccountName,
    pub permission: AccountName,
    pub parent: AccountName,
    pub auth: Authority,
}

impl SystemAction for UpdateAuth {
    const NAME: &'static str = "updateauth";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAuth {
    pub account: AccountName,
    pub permission: AccountName,
}

impl SystemAction for DeleteAuth {
    const NAME: &'static str = "deleteauth";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPriv {
    pub account: AccountName,
    pub is_priv: bool,
}

impl SystemAction for SetPriv {
    const NAME: &'static str = "setpriv";
}

/// Delivered to the sender of a failed deferred transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnError {
    pub sender_id: u128,
    pub sent_trx_id: TransactionId,
    /// bincode-encoded `Transaction`.
    pub sent_trx: Vec<u8>,
}

impl SystemAction for OnError {
    const NAME: &'static str = "onerror";
}

/// Implicit first transaction of every block, carrying the previous header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnBlock {
    pub header: BlockHeader,
}

impl SystemAction for OnBlock {
    const NAME: &'static str = "onblock";
}
