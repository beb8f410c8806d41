//! Account manager: authoritative owner of every user balance.
//!
//! Fine-grained per-user locking, as spec'd — a fill touches two users and
//! must take both locks in canonical order (lower `user_id` first) to avoid
//! deadlock, the same discipline the teacher's ledger applies to multi-leg
//! settlement (`backtest_v2::ledger`), generalized here from its prediction-
//! market accounts to a plain free/locked asset balance per user.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{AssetMap, Balance, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("insufficient {asset} balance for user {user_id}: free={free} requested={requested}")]
    InsufficientBalance {
        user_id: UserId,
        asset: String,
        free: Decimal,
        requested: Decimal,
    },
    #[error("cannot release {requested} {asset} for user {user_id}: only {locked} locked")]
    OverRelease {
        user_id: UserId,
        asset: String,
        locked: Decimal,
        requested: Decimal,
    },
}

#[derive(Debug, Default)]
struct UserAccount {
    balances: AssetMap,
    update_time: i64,
}

/// Snapshot returned by `snapshot()` — mirrors Binance's `/api/v3/account`
/// payload shape closely enough for the REST façade to forward directly.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub user_id: UserId,
    pub balances: AssetMap,
    pub update_time: i64,
}

pub struct AccountManager {
    accounts: RwLock<HashMap<UserId, Mutex<UserAccount>>>,
    api_keys: RwLock<HashMap<String, UserId>>,
    fee_account: Mutex<AssetMap>,
    next_user_id: std::sync::atomic::AtomicU64,
}

impl AccountManager {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            api_keys: RwLock::new(HashMap::new()),
            fee_account: Mutex::new(HashMap::new()),
            next_user_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Register a fresh user, returning a generated opaque 64-hex-char API key.
    pub fn register_user(&self) -> (UserId, String) {
        let user_id = self
            .next_user_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.accounts
            .write()
            .unwrap()
            .insert(user_id, Mutex::new(UserAccount::default()));
        let api_key = generate_api_key();
        self.api_keys.write().unwrap().insert(api_key.clone(), user_id);
        (user_id, api_key)
    }

    pub fn resolve_api_key(&self, api_key: &str) -> Option<UserId> {
        self.api_keys.read().unwrap().get(api_key).copied()
    }

    fn with_account<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut UserAccount) -> Result<T, AccountError>,
    ) -> Result<T, AccountError> {
        let accounts = self.accounts.read().unwrap();
        let account = accounts
            .get(&user_id)
            .ok_or(AccountError::UnknownUser(user_id))?;
        let mut guard = account.lock().unwrap();
        f(&mut guard)
    }

    pub fn deposit(&self, user_id: UserId, asset: &str, amount: Decimal, now_ms: i64) -> Result<(), AccountError> {
        self.with_account(user_id, |acc| {
            acc.balances.entry(asset.to_string()).or_default().free += amount;
            acc.update_time = now_ms;
            Ok(())
        })
    }

    pub fn withdraw(&self, user_id: UserId, asset: &str, amount: Decimal, now_ms: i64) -> Result<(), AccountError> {
        self.with_account(user_id, |acc| {
            let balance = acc.balances.entry(asset.to_string()).or_default();
            if balance.free < amount {
                return Err(AccountError::InsufficientBalance {
                    user_id,
                    asset: asset.to_string(),
                    free: balance.free,
                    requested: amount,
                });
            }
            balance.free -= amount;
            acc.update_time = now_ms;
            Ok(())
        })
    }

    /// Reserve `amount` of `asset` from free into locked. Returns `false`
    /// (no partial effect) if free balance is insufficient.
    pub fn reserve(&self, user_id: UserId, asset: &str, amount: Decimal) -> Result<bool, AccountError> {
        self.with_account(user_id, |acc| {
            let balance = acc.balances.entry(asset.to_string()).or_default();
            if balance.free < amount {
                return Ok(false);
            }
            balance.free -= amount;
            balance.locked += amount;
            Ok(true)
        })
    }

    /// Inverse of `reserve`: moves `amount` back from locked to free.
    pub fn release(&self, user_id: UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        self.with_account(user_id, |acc| {
            let balance = acc.balances.entry(asset.to_string()).or_default();
            if balance.locked < amount {
                return Err(AccountError::OverRelease {
                    user_id,
                    asset: asset.to_string(),
                    locked: balance.locked,
                    requested: amount,
                });
            }
            balance.locked -= amount;
            balance.free += amount;
            Ok(())
        })
    }

    /// Atomically settle one fill between a buyer and a seller, taking both
    /// users' locks in canonical (lower `user_id` first) order to avoid
    /// deadlock against a concurrent fill that touches the same pair in the
    /// opposite role.
    #[allow(clippy::too_many_arguments)]
    pub fn settle_fill(
        &self,
        buy_user: UserId,
        sell_user: UserId,
        base_asset: &str,
        quote_asset: &str,
        price: Decimal,
        quantity: Decimal,
        buy_commission_rate: Decimal,
        sell_commission_rate: Decimal,
        now_ms: i64,
    ) -> Result<(), AccountError> {
        let quote_amount = price * quantity;
        let accounts = self.accounts.read().unwrap();
        let buy_acc = accounts
            .get(&buy_user)
            .ok_or(AccountError::UnknownUser(buy_user))?;
        let sell_acc = accounts
            .get(&sell_user)
            .ok_or(AccountError::UnknownUser(sell_user))?;

        let base_fee: Decimal;
        let quote_fee: Decimal;

        if buy_user == sell_user {
            // Self-trade slipping through with STP::None: both legs belong
            // to the same account, lock it exactly once.
            let mut acc = buy_acc.lock().unwrap();
            let base_credit = quantity * (Decimal::ONE - buy_commission_rate);
            base_fee = quantity * buy_commission_rate;
            acc.balances.entry(quote_asset.to_string()).or_default().locked -= quote_amount;
            acc.balances.entry(base_asset.to_string()).or_default().free += base_credit;

            let quote_credit = quote_amount * (Decimal::ONE - sell_commission_rate);
            quote_fee = quote_amount * sell_commission_rate;
            acc.balances.entry(base_asset.to_string()).or_default().locked -= quantity;
            acc.balances.entry(quote_asset.to_string()).or_default().free += quote_credit;
            acc.update_time = now_ms;
        } else {
            let (first_id, second_id) = if buy_user < sell_user {
                (buy_user, sell_user)
            } else {
                (sell_user, buy_user)
            };
            let first = accounts.get(&first_id).unwrap();
            let second = accounts.get(&second_id).unwrap();
            let mut first_guard = first.lock().unwrap();
            let mut second_guard = second.lock().unwrap();

            let (buyer, seller) = if first_id == buy_user {
                (&mut *first_guard, &mut *second_guard)
            } else {
                (&mut *second_guard, &mut *first_guard)
            };

            let base_credit = quantity * (Decimal::ONE - buy_commission_rate);
            base_fee = quantity * buy_commission_rate;
            buyer.balances.entry(quote_asset.to_string()).or_default().locked -= quote_amount;
            buyer.balances.entry(base_asset.to_string()).or_default().free += base_credit;
            buyer.update_time = now_ms;

            let quote_credit = quote_amount * (Decimal::ONE - sell_commission_rate);
            quote_fee = quote_amount * sell_commission_rate;
            seller.balances.entry(base_asset.to_string()).or_default().locked -= quantity;
            seller.balances.entry(quote_asset.to_string()).or_default().free += quote_credit;
            seller.update_time = now_ms;
        }

        let mut fees = self.fee_account.lock().unwrap();
        fees.entry(base_asset.to_string()).or_default().free += base_fee;
        fees.entry(quote_asset.to_string()).or_default().free += quote_fee;
        Ok(())
    }

    pub fn snapshot(&self, user_id: UserId) -> Result<AccountSnapshot, AccountError> {
        self.with_account(user_id, |acc| {
            Ok(AccountSnapshot {
                user_id,
                balances: acc.balances.clone(),
                update_time: acc.update_time,
            })
        })
    }

    pub fn fee_account_snapshot(&self) -> AssetMap {
        self.fee_account.lock().unwrap().clone()
    }

    pub fn balance_of(&self, user_id: UserId, asset: &str) -> Result<Balance, AccountError> {
        self.with_account(user_id, |acc| Ok(acc.balances.get(asset).copied().unwrap_or_default()))
    }
}

impl Default for AccountManager {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reserve_moves_free_to_locked() {
        let mgr = AccountManager::new();
        let (uid, _) = mgr.register_user();
        mgr.deposit(uid, "USDT", dec!(100), 0).unwrap();
        assert!(mgr.reserve(uid, "USDT", dec!(40)).unwrap());
        let bal = mgr.balance_of(uid, "USDT").unwrap();
        assert_eq!(bal.free, dec!(60));
        assert_eq!(bal.locked, dec!(40));
    }

    #[test]
    fn reserve_fails_without_partial_effect() {
        let mgr = AccountManager::new();
        let (uid, _) = mgr.register_user();
        mgr.deposit(uid, "USDT", dec!(10), 0).unwrap();
        assert!(!mgr.reserve(uid, "USDT", dec!(20)).unwrap());
        let bal = mgr.balance_of(uid, "USDT").unwrap();
        assert_eq!(bal.free, dec!(10));
        assert_eq!(bal.locked, dec!(0));
    }

    #[test]
    fn release_is_inverse_of_reserve() {
        let mgr = AccountManager::new();
        let (uid, _) = mgr.register_user();
        mgr.deposit(uid, "USDT", dec!(100), 0).unwrap();
        mgr.reserve(uid, "USDT", dec!(40)).unwrap();
        mgr.release(uid, "USDT", dec!(40)).unwrap();
        let bal = mgr.balance_of(uid, "USDT").unwrap();
        assert_eq!(bal.free, dec!(100));
        assert_eq!(bal.locked, dec!(0));
    }

    #[test]
    fn settle_fill_conserves_value_across_two_users() {
        let mgr = AccountManager::new();
        let (buyer, _) = mgr.register_user();
        let (seller, _) = mgr.register_user();
        mgr.deposit(buyer, "USDT", dec!(1000), 0).unwrap();
        mgr.deposit(seller, "BTC", dec!(10), 0).unwrap();
        mgr.reserve(buyer, "USDT", dec!(500)).unwrap();
        mgr.reserve(seller, "BTC", dec!(5)).unwrap();

        mgr.settle_fill(
            buyer,
            seller,
            "BTC",
            "USDT",
            dec!(100),
            dec!(5),
            dec!(0.001),
            dec!(0.001),
            0,
        )
        .unwrap();

        let buyer_base = mgr.balance_of(buyer, "BTC").unwrap();
        let seller_quote = mgr.balance_of(seller, "USDT").unwrap();
        assert_eq!(buyer_base.free, dec!(5) * (Decimal::ONE - dec!(0.001)));
        assert_eq!(seller_quote.free, dec!(500) * (Decimal::ONE - dec!(0.001)));

        let fees = mgr.fee_account_snapshot();
        assert!(fees.get("BTC").unwrap().free > Decimal::ZERO);
        assert!(fees.get("USDT").unwrap().free > Decimal::ZERO);
    }

    #[test]
    fn settle_fill_lock_order_is_canonical_regardless_of_buyer_seller_ids() {
        let mgr = AccountManager::new();
        let (a, _) = mgr.register_user();
        let (b, _) = mgr.register_user();
        mgr.deposit(a, "BTC", dec!(10), 0).unwrap();
        mgr.deposit(b, "USDT", dec!(1000), 0).unwrap();
        mgr.reserve(a, "BTC", dec!(1)).unwrap();
        mgr.reserve(b, "USDT", dec!(100)).unwrap();
        // here the seller (a) has the lower user_id than the buyer (b)
        mgr.settle_fill(b, a, "BTC", "USDT", dec!(100), dec!(1), dec!(0), dec!(0), 0)
            .unwrap();
        assert_eq!(mgr.balance_of(b, "BTC").unwrap().free, dec!(1));
        assert_eq!(mgr.balance_of(a, "USDT").unwrap().free, dec!(100));
    }

    #[test]
    fn resolve_api_key_roundtrips() {
        let mgr = AccountManager::new();
        let (uid, key) = mgr.register_user();
        assert_eq!(mgr.resolve_api_key(&key), Some(uid));
        assert_eq!(mgr.resolve_api_key("not-a-real-key"), None);
    }
}
