//! Plan catalog and Stripe product/price synchronization
//!
//! Plans are defined locally and pushed to Stripe. Each plan owns one Stripe
//! Product and one *current* Stripe Price. Stripe prices are immutable, so any
//! change to a price-affecting field creates a fresh Price and archives the
//! previous one; existing subscriptions keep billing on the archived price
//! until they are migrated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tenantdesk_shared::{BillingInterval, PricingModel};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Maximum trial length accepted on a plan
pub const MAX_TRIAL_DAYS: i32 = 730;

/// One pricing tier. `up_to = None` marks the final, unbounded tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTier {
    pub up_to: Option<i64>,
    pub unit_amount_cents: i64,
    #[serde(default)]
    pub flat_amount_cents: i64,
}

/// Input for creating a plan
#[derive(Debug, Clone, Deserialize)]
pub struct PlanInput {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub pricing_model: PricingModel,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_interval")]
    pub interval: BillingInterval,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub tiers: Vec<PlanTier>,
    #[serde(default)]
    pub trial_days: i32,
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_interval() -> BillingInterval {
    BillingInterval::Month
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pricing_model: Option<PricingModel>,
    pub currency: Option<String>,
    pub interval: Option<BillingInterval>,
    pub amount_cents: Option<i64>,
    pub tiers: Option<Vec<PlanTier>>,
    pub trial_days: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub pricing_model: PricingModel,
    pub currency: String,
    pub interval: BillingInterval,
    pub amount_cents: Option<i64>,
    pub tiers: Vec<PlanTier>,
    pub trial_days: i32,
    pub is_active: bool,
    pub stripe_product_id: Option<String>,
    pub stripe_price_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub synced_at: Option<OffsetDateTime>,
}

impl Plan {
    fn from_input(input: PlanInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            slug: input.slug,
            name: input.name,
            description: input.description,
            pricing_model: input.pricing_model,
            currency: input.currency.to_lowercase(),
            interval: input.interval,
            amount_cents: input.amount_cents,
            tiers: input.tiers,
            trial_days: input.trial_days,
            is_active: true,
            stripe_product_id: None,
            stripe_price_id: None,
            synced_at: None,
        }
    }

    /// Apply a partial update, returning the new definition
    pub fn apply(&self, update: PlanUpdate) -> Self {
        let mut next = self.clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(description) = update.description {
            next.description = if description.trim().is_empty() {
                None
            } else {
                Some(description)
            };
        }
        if let Some(model) = update.pricing_model {
            next.pricing_model = model;
        }
        if let Some(currency) = update.currency {
            next.currency = currency.to_lowercase();
        }
        if let Some(interval) = update.interval {
            next.interval = interval;
        }
        if let Some(amount) = update.amount_cents {
            next.amount_cents = Some(amount);
        }
        if let Some(tiers) = update.tiers {
            next.tiers = tiers;
        }
        if let Some(days) = update.trial_days {
            next.trial_days = days;
        }
        // Switching between unit and tiered pricing drops the other side
        if next.pricing_model.uses_tiers() {
            next.amount_cents = None;
        } else {
            next.tiers.clear();
        }
        next
    }

    /// True when `other` would need a different Stripe Price than `self`
    pub fn price_fields_changed(&self, other: &Plan) -> bool {
        self.pricing_model != other.pricing_model
            || self.currency != other.currency
            || self.interval != other.interval
            || self.amount_cents != other.amount_cents
            || self.tiers != other.tiers
    }

    pub fn validate(&self) -> BillingResult<()> {
        validate_slug(&self.slug)?;

        if self.name.trim().is_empty() {
            return Err(BillingError::InvalidInput("Plan name is required".to_string()));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid currency code: {}",
                self.currency
            )));
        }
        if !(0..=MAX_TRIAL_DAYS).contains(&self.trial_days) {
            return Err(BillingError::InvalidInput(format!(
                "Trial days must be between 0 and {}",
                MAX_TRIAL_DAYS
            )));
        }

        if self.pricing_model.uses_tiers() {
            validate_tiers(&self.tiers)
        } else {
            match self.amount_cents {
                Some(amount) if amount >= 0 => Ok(()),
                Some(_) => Err(BillingError::InvalidInput(
                    "amount_cents must not be negative".to_string(),
                )),
                None => Err(BillingError::InvalidInput(format!(
                    "{} plans require amount_cents",
                    self.pricing_model
                ))),
            }
        }
    }
}

/// What a plan update has to do in Stripe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceAction {
    /// The plan has no Stripe product yet
    FullSync,
    /// Update the product only; the current price still matches
    Keep { product_id: String },
    /// Mint a new price and archive the current one
    Replace { product_id: String },
}

impl PriceAction {
    /// Compare the stored plan with the requested definition. `current` is
    /// always what the stored Stripe price was built from, since the row is only
    /// rewritten after Stripe accepted the change.
    pub fn for_update(current: &Plan, next: &Plan) -> Self {
        let Some(product_id) = current.stripe_product_id.clone() else {
            return PriceAction::FullSync;
        };
        if current.stripe_price_id.is_none() || current.price_fields_changed(next) {
            PriceAction::Replace { product_id }
        } else {
            PriceAction::Keep { product_id }
        }
    }
}

fn validate_slug(slug: &str) -> BillingResult<()> {
    let valid = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BillingError::InvalidInput(format!("Invalid plan slug: {}", slug)))
    }
}

/// Tier rules: at least one tier, only the last one unbounded, bounds strictly increasing
pub fn validate_tiers(tiers: &[PlanTier]) -> BillingResult<()> {
    let Some((last, bounded)) = tiers.split_last() else {
        return Err(BillingError::InvalidInput(
            "Tiered pricing requires at least one tier".to_string(),
        ));
    };

    if last.up_to.is_some() {
        return Err(BillingError::InvalidInput(
            "The last tier must be unbounded".to_string(),
        ));
    }

    let mut previous = 0i64;
    for (idx, tier) in bounded.iter().enumerate() {
        let up_to = tier.up_to.ok_or_else(|| {
            BillingError::InvalidInput(format!("Tier {} is unbounded but is not the last tier", idx + 1))
        })?;
        if up_to <= previous {
            return Err(BillingError::InvalidInput(format!(
                "Tier bounds must strictly increase (tier {} has up_to {})",
                idx + 1,
                up_to
            )));
        }
        previous = up_to;
    }

    if tiers
        .iter()
        .any(|t| t.unit_amount_cents < 0 || t.flat_amount_cents < 0)
    {
        return Err(BillingError::InvalidInput(
            "Tier amounts must not be negative".to_string(),
        ));
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    slug: String,
    name: String,
    description: Option<String>,
    pricing_model: String,
    currency: String,
    billing_interval: String,
    amount_cents: Option<i64>,
    tiers: Json<Vec<PlanTier>>,
    trial_days: i32,
    is_active: bool,
    stripe_product_id: Option<String>,
    stripe_price_id: Option<String>,
    synced_at: Option<OffsetDateTime>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            slug: row.slug,
            name: row.name,
            description: row.description,
            pricing_model: row
                .pricing_model
                .parse()
                .map_err(|e| BillingError::Internal(format!("{}", e)))?,
            currency: row.currency,
            interval: row
                .billing_interval
                .parse()
                .map_err(|e| BillingError::Internal(format!("{}", e)))?,
            amount_cents: row.amount_cents,
            tiers: row.tiers.0,
            trial_days: row.trial_days,
            is_active: row.is_active,
            stripe_product_id: row.stripe_product_id,
            stripe_price_id: row.stripe_price_id,
            synced_at: row.synced_at,
        })
    }
}

const PLAN_COLUMNS: &str = "id, slug, name, description, pricing_model, currency, billing_interval, \
     amount_cents, tiers, trial_days, is_active, stripe_product_id, stripe_price_id, synced_at";

// ============ STRIPE FORMS ============

#[derive(Debug, Serialize)]
struct ProductForm<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active: Option<bool>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct PriceTierForm {
    /// Stripe takes either a number or the literal `inf`
    up_to: String,
    unit_amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    flat_amount: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RecurringForm {
    interval: &'static str,
    usage_type: &'static str,
}

#[derive(Debug, Serialize)]
struct PriceForm<'a> {
    product: &'a str,
    currency: &'a str,
    nickname: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    billing_scheme: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tiers_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tiers: Vec<PriceTierForm>,
    recurring: RecurringForm,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ArchivePriceForm {
    active: bool,
}

fn plan_metadata(plan: &Plan) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("plan_id".to_string(), plan.id.to_string());
    metadata.insert("plan_slug".to_string(), plan.slug.clone());
    metadata
}

/// Build the Stripe price parameters for a plan's pricing model
fn price_form<'a>(plan: &'a Plan, product_id: &'a str) -> PriceForm<'a> {
    let (unit_amount, billing_scheme, tiers_mode) = match plan.pricing_model {
        PricingModel::Flat | PricingModel::PerSeat => (plan.amount_cents, None, None),
        PricingModel::Tiered => (None, Some("tiered"), Some("graduated")),
        PricingModel::Volume => (None, Some("tiered"), Some("volume")),
    };

    let tiers = if plan.pricing_model.uses_tiers() {
        plan.tiers
            .iter()
            .map(|tier| PriceTierForm {
                up_to: tier
                    .up_to
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "inf".to_string()),
                unit_amount: tier.unit_amount_cents,
                flat_amount: (tier.flat_amount_cents > 0).then_some(tier.flat_amount_cents),
            })
            .collect()
    } else {
        Vec::new()
    };

    PriceForm {
        product: product_id,
        currency: &plan.currency,
        nickname: &plan.name,
        unit_amount,
        billing_scheme,
        tiers_mode,
        tiers,
        recurring: RecurringForm {
            interval: plan.interval.as_str(),
            usage_type: "licensed",
        },
        metadata: plan_metadata(plan),
    }
}

/// Owns the plan catalog and keeps it mirrored in Stripe
#[derive(Clone)]
pub struct PlanService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PlanService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn list(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active OR $1 ORDER BY created_at"
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Plan::try_from).collect()
    }

    pub async fn get(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))?
            .try_into()
    }

    /// Create a plan locally, then push it to Stripe
    pub async fn create(&self, input: PlanInput) -> BillingResult<Plan> {
        let plan = Plan::from_input(input);
        plan.validate()?;

        let result = sqlx::query(
            r#"
            INSERT INTO plans (
                id, slug, name, description, pricing_model, currency, billing_interval,
                amount_cents, tiers, trial_days, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE)
            ON CONFLICT (slug) DO NOTHING
            "#,
        )
        .bind(plan.id)
        .bind(&plan.slug)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.pricing_model.as_str())
        .bind(&plan.currency)
        .bind(plan.interval.as_str())
        .bind(plan.amount_cents)
        .bind(Json(&plan.tiers))
        .bind(plan.trial_days)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::InvalidInput(format!(
                "Plan slug {} already exists",
                plan.slug
            )));
        }

        tracing::info!(plan_id = %plan.id, slug = %plan.slug, "Plan created");

        self.sync(plan).await
    }

    /// Update a plan; a new Stripe Price is minted when pricing changed.
    ///
    /// Stripe is called before the row is written, so a failed Stripe call
    /// leaves the stored definition untouched and a retry sees the same change.
    pub async fn update(&self, plan_id: Uuid, update: PlanUpdate) -> BillingResult<Plan> {
        let current = self.get(plan_id).await?;
        let next = current.apply(update);
        next.validate()?;

        match PriceAction::for_update(&current, &next) {
            PriceAction::FullSync => {
                // Never reached Stripe; store the definition and push it
                self.save_definition(&next, None, false).await?;
                self.sync(next).await
            }
            PriceAction::Keep { product_id } => {
                self.update_product(&product_id, &next).await?;
                self.save_definition(&next, None, true).await
            }
            PriceAction::Replace { product_id } => {
                self.update_product(&product_id, &next).await?;
                let new_price_id = self.create_price(&next, &product_id).await?;
                let plan = self
                    .save_definition(&next, Some(&new_price_id), true)
                    .await?;

                if let Some(old_price_id) = current.stripe_price_id.as_deref() {
                    // The plan already points at the new price; a live old price
                    // only keeps existing subscriptions billing as before
                    if let Err(e) = self.archive_price(old_price_id).await {
                        tracing::warn!(
                            plan_id = %plan.id,
                            price_id = %old_price_id,
                            error = %e,
                            "Failed to archive replaced Stripe price"
                        );
                    }
                }

                tracing::info!(
                    plan_id = %plan.id,
                    old_price_id = ?current.stripe_price_id,
                    new_price_id = %new_price_id,
                    "Plan price replaced"
                );
                Ok(plan)
            }
        }
    }

    /// Deactivate a plan locally and archive its Stripe product
    pub async fn archive(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let mut plan = self.get(plan_id).await?;

        sqlx::query("UPDATE plans SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await?;
        plan.is_active = false;

        if let Some(product_id) = plan.stripe_product_id.as_deref() {
            let form = ProductForm {
                name: None,
                description: None,
                active: Some(false),
                metadata: HashMap::new(),
            };
            let _: stripe::Product = self
                .stripe
                .inner()
                .post_form(&format!("/products/{}", product_id), form)
                .await?;
        }

        tracing::info!(plan_id = %plan_id, "Plan archived");
        Ok(plan)
    }

    /// Push a plan to Stripe, creating whatever is missing
    pub async fn sync(&self, plan: Plan) -> BillingResult<Plan> {
        let product_id = match plan.stripe_product_id.clone() {
            Some(id) => id,
            None => self.create_product(&plan).await?,
        };

        let price_id = match plan.stripe_price_id.clone() {
            Some(id) => id,
            None => self.create_price(&plan, &product_id).await?,
        };

        self.store_stripe_ids(plan, &product_id, &price_id).await
    }

    async fn create_product(&self, plan: &Plan) -> BillingResult<String> {
        let form = ProductForm {
            name: Some(&plan.name),
            description: plan.description.as_deref(),
            active: None,
            metadata: plan_metadata(plan),
        };

        let product: stripe::Product = self.stripe.inner().post_form("/products", form).await?;

        tracing::info!(plan_id = %plan.id, product_id = %product.id, "Created Stripe product");
        Ok(product.id.to_string())
    }

    async fn update_product(&self, product_id: &str, plan: &Plan) -> BillingResult<()> {
        let form = ProductForm {
            name: Some(&plan.name),
            // Stripe clears the description on an empty string
            description: Some(plan.description.as_deref().unwrap_or("")),
            active: None,
            metadata: HashMap::new(),
        };

        let _: stripe::Product = self
            .stripe
            .inner()
            .post_form(&format!("/products/{}", product_id), form)
            .await?;
        Ok(())
    }

    async fn create_price(&self, plan: &Plan, product_id: &str) -> BillingResult<String> {
        let form = price_form(plan, product_id);
        let price: stripe::Price = self.stripe.inner().post_form("/prices", form).await?;

        tracing::info!(
            plan_id = %plan.id,
            price_id = %price.id,
            pricing_model = %plan.pricing_model,
            "Created Stripe price"
        );
        Ok(price.id.to_string())
    }

    async fn archive_price(&self, price_id: &str) -> BillingResult<()> {
        let _: stripe::Price = self
            .stripe
            .inner()
            .post_form(
                &format!("/prices/{}", price_id),
                ArchivePriceForm { active: false },
            )
            .await?;

        tracing::info!(price_id = %price_id, "Archived Stripe price");
        Ok(())
    }

    async fn store_stripe_ids(
        &self,
        mut plan: Plan,
        product_id: &str,
        price_id: &str,
    ) -> BillingResult<Plan> {
        let synced_at: (OffsetDateTime,) = sqlx::query_as(
            r#"
            UPDATE plans
            SET stripe_product_id = $2, stripe_price_id = $3, synced_at = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING synced_at
            "#,
        )
        .bind(plan.id)
        .bind(product_id)
        .bind(price_id)
        .fetch_one(&self.pool)
        .await?;

        plan.stripe_product_id = Some(product_id.to_string());
        plan.stripe_price_id = Some(price_id.to_string());
        plan.synced_at = Some(synced_at.0);
        Ok(plan)
    }

    /// Write the plan definition, and the new price id when one was minted,
    /// in a single statement
    async fn save_definition(
        &self,
        plan: &Plan,
        new_price_id: Option<&str>,
        synced: bool,
    ) -> BillingResult<Plan> {
        let (stripe_price_id, synced_at): (Option<String>, Option<OffsetDateTime>) =
            sqlx::query_as(
                r#"
                UPDATE plans
                SET name = $2, description = $3, pricing_model = $4, currency = $5,
                    billing_interval = $6, amount_cents = $7, tiers = $8, trial_days = $9,
                    stripe_price_id = COALESCE($10, stripe_price_id),
                    synced_at = CASE WHEN $11 THEN NOW() ELSE synced_at END,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING stripe_price_id, synced_at
                "#,
            )
            .bind(plan.id)
            .bind(&plan.name)
            .bind(&plan.description)
            .bind(plan.pricing_model.as_str())
            .bind(&plan.currency)
            .bind(plan.interval.as_str())
            .bind(plan.amount_cents)
            .bind(Json(&plan.tiers))
            .bind(plan.trial_days)
            .bind(new_price_id)
            .bind(synced)
            .fetch_one(&self.pool)
            .await?;

        let mut saved = plan.clone();
        saved.stripe_price_id = stripe_price_id;
        saved.synced_at = synced_at;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(up_to: Option<i64>, unit: i64) -> PlanTier {
        PlanTier {
            up_to,
            unit_amount_cents: unit,
            flat_amount_cents: 0,
        }
    }

    fn flat_plan() -> Plan {
        Plan::from_input(PlanInput {
            slug: "starter".to_string(),
            name: "Starter".to_string(),
            description: None,
            pricing_model: PricingModel::Flat,
            currency: "USD".to_string(),
            interval: BillingInterval::Month,
            amount_cents: Some(1_900),
            tiers: Vec::new(),
            trial_days: 14,
        })
    }

    fn tiered_plan(model: PricingModel) -> Plan {
        Plan::from_input(PlanInput {
            slug: "scale".to_string(),
            name: "Scale".to_string(),
            description: Some("Usage tiers".to_string()),
            pricing_model: model,
            currency: "eur".to_string(),
            interval: BillingInterval::Year,
            amount_cents: None,
            tiers: vec![tier(Some(10), 1_000), tier(Some(50), 800), tier(None, 500)],
            trial_days: 0,
        })
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_flat_plan_is_valid_and_currency_lowercased() {
        let plan = flat_plan();
        assert_eq!(plan.currency, "usd");
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_flat_plan_requires_non_negative_amount() {
        let mut plan = flat_plan();
        plan.amount_cents = Some(-1);
        assert!(plan.validate().is_err());

        plan.amount_cents = None;
        assert!(plan.validate().is_err());

        plan.amount_cents = Some(0);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_tiers_require_at_least_one() {
        assert!(validate_tiers(&[]).is_err());
        assert!(validate_tiers(&[tier(None, 100)]).is_ok());
    }

    #[test]
    fn test_last_tier_must_be_unbounded() {
        let err = validate_tiers(&[tier(Some(10), 100), tier(Some(20), 90)]).unwrap_err();
        assert!(err.to_string().contains("unbounded"));
    }

    #[test]
    fn test_bounded_tiers_strictly_increase() {
        assert!(validate_tiers(&[tier(Some(10), 100), tier(Some(10), 90), tier(None, 80)]).is_err());
        assert!(validate_tiers(&[tier(Some(20), 100), tier(Some(10), 90), tier(None, 80)]).is_err());
        assert!(validate_tiers(&[tier(Some(0), 100), tier(None, 80)]).is_err());
    }

    #[test]
    fn test_unbounded_tier_in_the_middle_rejected() {
        assert!(validate_tiers(&[tier(None, 100), tier(None, 90)]).is_err());
    }

    #[test]
    fn test_negative_tier_amount_rejected() {
        assert!(validate_tiers(&[tier(Some(5), -1), tier(None, 10)]).is_err());
    }

    #[test]
    fn test_slug_and_trial_bounds() {
        let mut plan = flat_plan();
        plan.slug = "Has Spaces".to_string();
        assert!(plan.validate().is_err());

        let mut plan = flat_plan();
        plan.trial_days = MAX_TRIAL_DAYS + 1;
        assert!(plan.validate().is_err());
    }

    // ========================================================================
    // Price-change detection
    // ========================================================================

    #[test]
    fn test_name_change_keeps_price() {
        let plan = flat_plan();
        let next = plan.apply(PlanUpdate {
            name: Some("Starter+".to_string()),
            trial_days: Some(30),
            ..Default::default()
        });
        assert!(!plan.price_fields_changed(&next));
    }

    #[test]
    fn test_amount_change_needs_new_price() {
        let plan = flat_plan();
        let next = plan.apply(PlanUpdate {
            amount_cents: Some(2_900),
            ..Default::default()
        });
        assert!(plan.price_fields_changed(&next));
    }

    #[test]
    fn test_interval_or_tier_change_needs_new_price() {
        let plan = tiered_plan(PricingModel::Tiered);
        let yearly = plan.apply(PlanUpdate {
            interval: Some(BillingInterval::Month),
            ..Default::default()
        });
        assert!(plan.price_fields_changed(&yearly));

        let retiered = plan.apply(PlanUpdate {
            tiers: Some(vec![tier(Some(10), 900), tier(None, 500)]),
            ..Default::default()
        });
        assert!(plan.price_fields_changed(&retiered));
    }

    #[test]
    fn test_switching_to_tiers_drops_unit_amount() {
        let plan = flat_plan();
        let next = plan.apply(PlanUpdate {
            pricing_model: Some(PricingModel::Volume),
            tiers: Some(vec![tier(None, 100)]),
            ..Default::default()
        });
        assert_eq!(next.amount_cents, None);
        assert!(next.validate().is_ok());
        assert!(plan.price_fields_changed(&next));
    }

    // ========================================================================
    // Update decision
    // ========================================================================

    fn synced(mut plan: Plan) -> Plan {
        plan.stripe_product_id = Some("prod_1".to_string());
        plan.stripe_price_id = Some("price_1".to_string());
        plan
    }

    #[test]
    fn test_unsynced_plan_needs_full_sync() {
        let plan = flat_plan();
        let next = plan.apply(PlanUpdate {
            amount_cents: Some(2_900),
            ..Default::default()
        });
        assert_eq!(PriceAction::for_update(&plan, &next), PriceAction::FullSync);
    }

    #[test]
    fn test_cosmetic_update_keeps_price() {
        let plan = synced(flat_plan());
        let next = plan.apply(PlanUpdate {
            name: Some("Starter+".to_string()),
            ..Default::default()
        });
        assert_eq!(
            PriceAction::for_update(&plan, &next),
            PriceAction::Keep {
                product_id: "prod_1".to_string()
            }
        );
    }

    #[test]
    fn test_amount_update_replaces_price() {
        let plan = synced(flat_plan());
        let next = plan.apply(PlanUpdate {
            amount_cents: Some(2_000),
            ..Default::default()
        });
        assert!(matches!(
            PriceAction::for_update(&plan, &next),
            PriceAction::Replace { .. }
        ));
    }

    #[test]
    fn test_retry_after_failed_stripe_call_still_replaces() {
        // A failed attempt writes nothing, so the stored plan is unchanged
        let stored = synced(flat_plan());
        let update = PlanUpdate {
            amount_cents: Some(2_000),
            ..Default::default()
        };

        let first = stored.apply(update.clone());
        assert!(matches!(
            PriceAction::for_update(&stored, &first),
            PriceAction::Replace { .. }
        ));

        let retry = stored.apply(update);
        assert!(matches!(
            PriceAction::for_update(&stored, &retry),
            PriceAction::Replace { .. }
        ));
    }

    #[test]
    fn test_product_without_price_mints_one() {
        let mut plan = synced(flat_plan());
        plan.stripe_price_id = None;
        let next = plan.apply(PlanUpdate::default());
        assert_eq!(
            PriceAction::for_update(&plan, &next),
            PriceAction::Replace {
                product_id: "prod_1".to_string()
            }
        );
    }

    // ========================================================================
    // Stripe price parameters
    // ========================================================================

    #[test]
    fn test_flat_price_form_uses_unit_amount() {
        let plan = flat_plan();
        let form = serde_json::to_value(price_form(&plan, "prod_1")).unwrap();
        assert_eq!(form["unit_amount"], 1_900);
        assert_eq!(form["recurring"]["interval"], "month");
        assert_eq!(form["metadata"]["plan_id"], plan.id.to_string());
        assert!(form.get("billing_scheme").is_none());
        assert!(form.get("tiers").is_none());
    }

    #[test]
    fn test_tiered_price_form_is_graduated() {
        let plan = tiered_plan(PricingModel::Tiered);
        let form = serde_json::to_value(price_form(&plan, "prod_1")).unwrap();
        assert_eq!(form["billing_scheme"], "tiered");
        assert_eq!(form["tiers_mode"], "graduated");
        assert_eq!(form["recurring"]["interval"], "year");
        assert_eq!(form["tiers"][0]["up_to"], "10");
        assert_eq!(form["tiers"][2]["up_to"], "inf");
        assert!(form.get("unit_amount").is_none());
    }

    #[test]
    fn test_volume_price_form_uses_volume_mode() {
        let plan = tiered_plan(PricingModel::Volume);
        let form = serde_json::to_value(price_form(&plan, "prod_1")).unwrap();
        assert_eq!(form["tiers_mode"], "volume");
        assert_eq!(form["tiers"].as_array().map(|t| t.len()), Some(3));
    }
}
