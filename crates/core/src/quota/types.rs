//! Quota rows: monthly plans, overflow pools, top-ups and the consumption ledger.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tally_shared::types::{
    ConsumptionEntryId, DocumentId, OverflowPoolId, QuotaPlanId, TenantId, TopUpId, UserId,
    is_whole,
};
use uuid::Uuid;

use crate::fiscal::YearMonth;
use crate::ledger::LedgerError;

/// A non-negative whole number of quota units.
///
/// Units are integers throughout; fractional or negative quantities are rejected at
/// the boundary rather than truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct QuotaUnits(i64);

impl QuotaUnits {
    /// Zero units.
    pub const ZERO: Self = Self(0);

    /// Largest quantity a single request, plan or top-up may carry.
    pub const MAX: Self = Self(1_000_000_000_000);

    /// Creates a quantity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` for negative values or values above [`Self::MAX`].
    pub fn new(units: i64) -> Result<Self, LedgerError> {
        if units < 0 {
            return Err(LedgerError::InvalidQuantity(format!(
                "quota units cannot be negative: {units}"
            )));
        }
        if units > Self::MAX.0 {
            return Err(LedgerError::InvalidQuantity(format!(
                "quota units cannot exceed {}: {units}",
                Self::MAX.0
            )));
        }
        Ok(Self(units))
    }

    /// Creates a quantity from a collection length.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` if the length does not fit.
    pub fn from_count(count: usize) -> Result<Self, LedgerError> {
        i64::try_from(count)
            .map_err(|_| LedgerError::InvalidQuantity(format!("too many units: {count}")))
            .and_then(Self::new)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for QuotaUnits {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<Decimal> for QuotaUnits {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        if !is_whole(value) {
            return Err(LedgerError::InvalidQuantity(format!(
                "quota units must be whole: {value}"
            )));
        }
        let units = value
            .to_i64()
            .ok_or_else(|| LedgerError::InvalidQuantity(format!("out of range: {value}")))?;
        Self::new(units)
    }
}

impl From<QuotaUnits> for i64 {
    fn from(units: QuotaUnits) -> Self {
        units.0
    }
}

impl std::fmt::Display for QuotaUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a monthly plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    /// Spendable.
    Open,
    /// Month closed; remainder rolled to an overflow pool.
    Closed,
}

/// Monthly quota allocation for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPlanPeriod {
    /// Plan ID.
    pub id: QuotaPlanId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// Calendar year.
    pub year: i32,
    /// Calendar month, 1-12.
    pub month: u32,
    /// Units granted for the month.
    pub allocated: i64,
    /// Units left.
    pub available: i64,
    /// Plan state.
    pub state: PlanState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl QuotaPlanPeriod {
    /// A fresh OPEN plan with the whole allocation available.
    #[must_use]
    pub fn open(tenant_id: TenantId, period: YearMonth, allocated: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: QuotaPlanId::new(),
            tenant_id,
            year: period.year,
            month: period.month,
            allocated,
            available: allocated,
            state: PlanState::Open,
            created_at: now,
        }
    }

    /// The month the plan covers.
    #[must_use]
    pub fn period(&self) -> YearMonth {
        YearMonth {
            year: self.year,
            month: self.month,
        }
    }

    /// Units that can be drawn right now.
    #[must_use]
    pub fn spendable(&self) -> i64 {
        match self.state {
            PlanState::Open => self.available.max(0),
            PlanState::Closed => 0,
        }
    }
}

/// State of an overflow pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Spendable until expiry.
    Active,
    /// Fully drawn. Reversals bring it back to ACTIVE.
    Exhausted,
    /// Cancelled by a reopen of its origin month.
    Voided,
}

/// Unused plan units carried over from a closed month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowPool {
    /// Pool ID.
    pub id: OverflowPoolId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// Year of the month the units rolled over from.
    pub origin_year: i32,
    /// Month the units rolled over from.
    pub origin_month: u32,
    /// Units carried over at close.
    pub initial: i64,
    /// Units left.
    pub available: i64,
    /// Last day the pool can be drawn from.
    pub expiry_date: NaiveDate,
    /// Pool state.
    pub state: PoolState,
    /// Creation time; ties between pools of the same origin break on it.
    pub created_at: DateTime<Utc>,
}

impl OverflowPool {
    /// The month the units rolled over from.
    #[must_use]
    pub fn origin(&self) -> YearMonth {
        YearMonth {
            year: self.origin_year,
            month: self.origin_month,
        }
    }

    /// Returns true if the pool can be drawn from on `today`.
    #[must_use]
    pub fn is_spendable(&self, today: NaiveDate) -> bool {
        self.state == PoolState::Active && self.available > 0 && self.expiry_date >= today
    }
}

/// Expiry date of a pool rolled over from `origin`: the last day of the month
/// `lifetime_months` after it.
#[must_use]
pub fn overflow_expiry(origin: YearMonth, lifetime_months: u32) -> NaiveDate {
    origin.plus_months(lifetime_months).last_day()
}

/// State of a top-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopUpState {
    /// Spendable within its month.
    Active,
    /// Month closed; balance captured in the consumption ledger.
    Expired,
}

/// Extra units purchased for one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUp {
    /// Top-up ID.
    pub id: TopUpId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// Calendar year.
    pub year: i32,
    /// Calendar month, 1-12.
    pub month: u32,
    /// Units purchased.
    pub purchased: i64,
    /// Units left.
    pub available: i64,
    /// Top-up state.
    pub state: TopUpState,
    /// Purchase time; draws follow purchase order.
    pub purchased_at: DateTime<Utc>,
}

impl TopUp {
    /// The month the top-up belongs to.
    #[must_use]
    pub fn period(&self) -> YearMonth {
        YearMonth {
            year: self.year,
            month: self.month,
        }
    }

    /// Units that can be drawn right now.
    #[must_use]
    pub fn spendable(&self) -> i64 {
        match self.state {
            TopUpState::Active => self.available.max(0),
            TopUpState::Expired => 0,
        }
    }
}

/// What a consumption ledger row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumptionOp {
    /// Units drawn by a document.
    Consume,
    /// Units credited back by a reversal.
    Reverse,
    /// Plan remainder moved out at month close.
    Close,
    /// Top-up balance captured at month close.
    Expire,
    /// Balance restored by a reopen.
    Reopen,
}

impl ConsumptionOp {
    /// Lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Reverse => "reverse",
            Self::Close => "close",
            Self::Expire => "expire",
            Self::Reopen => "reopen",
        }
    }
}

/// Which row a consumption ledger entry moved units in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaSource {
    /// A monthly plan.
    Plan,
    /// An overflow pool.
    Overflow,
    /// A top-up.
    TopUp,
}

impl QuotaSource {
    /// Lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Overflow => "overflow",
            Self::TopUp => "top_up",
        }
    }
}

/// Append-only record of one balance movement on one source row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionLedgerEntry {
    /// Entry ID (time-ordered).
    pub id: ConsumptionEntryId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// What happened.
    pub op: ConsumptionOp,
    /// Kind of source row.
    pub source: QuotaSource,
    /// ID of the plan, pool or top-up row.
    pub source_id: Uuid,
    /// Units moved (always non-negative).
    pub amount: i64,
    /// Source balance before the movement.
    pub balance_before: i64,
    /// Source balance after the movement.
    pub balance_after: i64,
    /// Document that caused the movement. Cleared when the document is deleted.
    pub document_id: Option<DocumentId>,
    /// CONSUME entry a REVERSE entry undoes.
    pub reversal_of: Option<ConsumptionEntryId>,
    /// Month for CLOSE/EXPIRE/REOPEN entries.
    pub period: Option<YearMonth>,
    /// Who closed or reopened the month, for CLOSE/EXPIRE/REOPEN entries.
    pub actor: Option<UserId>,
    /// When the movement happened.
    pub created_at: DateTime<Utc>,
}

/// Remaining balance of one spendable overflow pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowBalance {
    /// Pool ID.
    pub pool_id: OverflowPoolId,
    /// Month the units rolled over from.
    pub origin: YearMonth,
    /// Units left.
    pub available: i64,
    /// Last spendable day.
    pub expiry_date: NaiveDate,
}

/// Point-in-time view of what a tenant can spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Month the status was computed for.
    pub period: YearMonth,
    /// Spendable plan units.
    pub plan_available: i64,
    /// Spendable overflow pools in draw order.
    pub overflow: Vec<OverflowBalance>,
    /// Spendable top-up units.
    pub top_up_available: i64,
}

impl QuotaStatus {
    /// Total spendable overflow units.
    #[must_use]
    pub fn overflow_available(&self) -> i64 {
        saturating_sum(self.overflow.iter().map(|p| p.available))
    }

    /// Total spendable units across all sources, saturating at `i64::MAX`.
    #[must_use]
    pub fn total_available(&self) -> i64 {
        self.plan_available
            .saturating_add(self.overflow_available())
            .saturating_add(self.top_up_available)
    }
}

/// Sums unit balances, saturating at `i64::MAX`.
#[must_use]
pub fn saturating_sum(units: impl IntoIterator<Item = i64>) -> i64 {
    units.into_iter().fold(0, i64::saturating_add)
}
