//! Transaction messages
//!
//! Every message type implements [`MsgDefinition`], which fixes its route
//! (the owning module) and its type identifier. The [`Msg`] enum is the
//! closed set of messages the application accepts; routing dispatches on
//! [`Msg::type_url`].

use crate::{
    bank::{MsgMultiSend, MsgSend},
    distribution::{MsgFundCommunityPool, MsgWithdrawDelegatorReward, MsgWithdrawValidatorCommission},
    evm::MsgEthereumTx,
    slashing::MsgUnjail,
    staking::{MsgCreateValidator, MsgDelegate, MsgUndelegate},
    types::Address,
    upgrade::{MsgCancelUpgrade, MsgSoftwareUpgrade},
    Result,
};
use serde::{Deserialize, Serialize};

/// Static description of a message type
pub trait MsgDefinition {
    /// Owning module
    const ROUTE: &'static str;
    /// Type identifier used for routing
    const TYPE_URL: &'static str;

    /// Stateless checks
    fn validate_basic(&self) -> Result<()>;

    /// Accounts that must sign, in order; the first pays fees
    fn signers(&self) -> Vec<Address>;
}

macro_rules! messages {
    ($($(#[$meta:meta])* $variant:ident($ty:ty)),+ $(,)?) => {
        /// Any accepted message
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum Msg {
            $($(#[$meta])* $variant($ty),)+
        }

        impl Msg {
            /// Owning module
            pub fn route(&self) -> &'static str {
                match self {
                    $(Msg::$variant(_) => <$ty as MsgDefinition>::ROUTE,)+
                }
            }

            /// Type identifier
            pub fn type_url(&self) -> &'static str {
                match self {
                    $(Msg::$variant(_) => <$ty as MsgDefinition>::TYPE_URL,)+
                }
            }

            /// Stateless checks
            pub fn validate_basic(&self) -> Result<()> {
                match self {
                    $(Msg::$variant(msg) => msg.validate_basic(),)+
                }
            }

            /// Required signers
            pub fn signers(&self) -> Vec<Address> {
                match self {
                    $(Msg::$variant(msg) => msg.signers(),)+
                }
            }

            /// Every known type identifier
            pub fn type_urls() -> &'static [&'static str] {
                &[$(<$ty as MsgDefinition>::TYPE_URL,)+]
            }
        }

        $(
            impl From<$ty> for Msg {
                fn from(msg: $ty) -> Self {
                    Msg::$variant(msg)
                }
            }
        )+
    };
}

messages! {
    /// Token transfer
    Send(MsgSend),
    /// Multi-party token transfer
    MultiSend(MsgMultiSend),
    /// New validator
    CreateValidator(MsgCreateValidator),
    /// Bond tokens
    Delegate(MsgDelegate),
    /// Start unbonding
    Undelegate(MsgUndelegate),
    /// Claim delegation rewards
    WithdrawDelegatorReward(MsgWithdrawDelegatorReward),
    /// Claim validator commission
    WithdrawValidatorCommission(MsgWithdrawValidatorCommission),
    /// Donate to the community pool
    FundCommunityPool(MsgFundCommunityPool),
    /// Leave jail
    Unjail(MsgUnjail),
    /// Schedule an upgrade
    SoftwareUpgrade(MsgSoftwareUpgrade),
    /// Cancel the pending upgrade
    CancelUpgrade(MsgCancelUpgrade),
    /// VM transaction
    EthereumTx(MsgEthereumTx),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coins;
    use std::collections::BTreeSet;

    #[test]
    fn test_type_urls_unique() {
        let urls = Msg::type_urls();
        let unique: BTreeSet<_> = urls.iter().collect();
        assert_eq!(unique.len(), urls.len());
    }

    #[test]
    fn test_dispatch_through_enum() {
        let from = Address([1; 20]);
        let msg: Msg = MsgSend {
            from_address: from,
            to_address: Address([2; 20]),
            amount: Coins::single("aphoton", 5),
        }
        .into();
        assert_eq!(msg.route(), "bank");
        assert_eq!(msg.type_url(), "/bank.MsgSend");
        assert_eq!(msg.signers(), vec![from]);
        msg.validate_basic().unwrap();

        let bytes = bincode::serialize(&msg).unwrap();
        assert_eq!(bincode::deserialize::<Msg>(&bytes).unwrap(), msg);
    }
}
