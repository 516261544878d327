use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelf_core::{AggregateId, DomainError, DomainResult};

pub const NAME_MIN_CHARS: usize = 3;
pub const NAME_MAX_CHARS: usize = 255;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.0
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// The mutable business fields of a product.
///
/// `price` is expressed in the smallest currency unit (e.g. cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    pub description: String,
    pub price: i64,
    pub stock_quantity: i64,
}

/// Authoritative (write-side) product record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    #[serde(flatten)]
    pub details: ProductDetails,
    /// Version of the last event appended for this product.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn name(&self) -> &str {
        &self.details.name
    }
}

/// Input for creating a product.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
}

impl NewProduct {
    /// Validate and normalize into product details.
    pub fn validate(&self) -> DomainResult<ProductDetails> {
        let name = validate_name(&self.name)?;
        let description = match &self.description {
            Some(d) => validate_description(d)?,
            None => String::new(),
        };
        validate_price(self.price)?;
        let stock_quantity = self.stock_quantity.unwrap_or(0);
        validate_stock(stock_quantity)?;

        Ok(ProductDetails {
            name,
            description,
            price: self.price,
            stock_quantity,
        })
    }
}

/// Logical product fields and their storage columns.
///
/// Partial updates go through this mapping instead of deriving column names
/// from input keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProductField {
    Name,
    Description,
    Price,
    StockQuantity,
}

impl ProductField {
    pub const ALL: [ProductField; 4] = [
        ProductField::Name,
        ProductField::Description,
        ProductField::Price,
        ProductField::StockQuantity,
    ];

    /// Column in the authoritative `products` table (and the read table).
    pub fn column(self) -> &'static str {
        match self {
            ProductField::Name => "name",
            ProductField::Description => "description",
            ProductField::Price => "price",
            ProductField::StockQuantity => "stock_quantity",
        }
    }
}

/// One field assignment from a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
    Name(String),
    Description(String),
    Price(i64),
    StockQuantity(i64),
}

impl FieldChange {
    pub fn field(&self) -> ProductField {
        match self {
            FieldChange::Name(_) => ProductField::Name,
            FieldChange::Description(_) => ProductField::Description,
            FieldChange::Price(_) => ProductField::Price,
            FieldChange::StockQuantity(_) => ProductField::StockQuantity,
        }
    }

    pub fn apply(&self, details: &mut ProductDetails) {
        match self {
            FieldChange::Name(v) => details.name = v.clone(),
            FieldChange::Description(v) => details.description = v.clone(),
            FieldChange::Price(v) => details.price = *v,
            FieldChange::StockQuantity(v) => details.stock_quantity = *v,
        }
    }
}

/// Partial update of a product. Only the present fields change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_quantity: Option<i64>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.stock_quantity.is_none()
    }

    /// Validate and normalize; an empty patch is rejected.
    pub fn validate(&self) -> DomainResult<ProductPatch> {
        if self.is_empty() {
            return Err(DomainError::validation("no fields to update"));
        }

        let name = self.name.as_deref().map(validate_name).transpose()?;
        let description = self
            .description
            .as_deref()
            .map(validate_description)
            .transpose()?;
        if let Some(price) = self.price {
            validate_price(price)?;
        }
        if let Some(stock) = self.stock_quantity {
            validate_stock(stock)?;
        }

        Ok(ProductPatch {
            name,
            description,
            price: self.price,
            stock_quantity: self.stock_quantity,
        })
    }

    /// Field assignments in a fixed field order.
    pub fn changes(&self) -> Vec<FieldChange> {
        let mut out = Vec::with_capacity(4);
        if let Some(v) = &self.name {
            out.push(FieldChange::Name(v.clone()));
        }
        if let Some(v) = &self.description {
            out.push(FieldChange::Description(v.clone()));
        }
        if let Some(v) = self.price {
            out.push(FieldChange::Price(v));
        }
        if let Some(v) = self.stock_quantity {
            out.push(FieldChange::StockQuantity(v));
        }
        out
    }

    pub fn apply_to(&self, details: &mut ProductDetails) {
        for change in self.changes() {
            change.apply(details);
        }
    }

    /// `base` with this patch applied.
    pub fn merged_over(&self, base: &ProductDetails) -> ProductDetails {
        let mut merged = base.clone();
        self.apply_to(&mut merged);
        merged
    }
}

fn validate_name(raw: &str) -> DomainResult<String> {
    let name = raw.trim();
    let len = name.chars().count();
    if len < NAME_MIN_CHARS {
        return Err(DomainError::validation(format!(
            "name must be at least {NAME_MIN_CHARS} characters"
        )));
    }
    if len > NAME_MAX_CHARS {
        return Err(DomainError::validation(format!(
            "name must be at most {NAME_MAX_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_description(raw: &str) -> DomainResult<String> {
    if raw.chars().count() > DESCRIPTION_MAX_CHARS {
        return Err(DomainError::validation(format!(
            "description must be at most {DESCRIPTION_MAX_CHARS} characters"
        )));
    }
    Ok(raw.to_string())
}

fn validate_price(price: i64) -> DomainResult<()> {
    if price < 0 {
        return Err(DomainError::validation("price must be >= 0"));
    }
    Ok(())
}

fn validate_stock(stock: i64) -> DomainResult<()> {
    if stock < 0 {
        return Err(DomainError::validation("stock_quantity must be >= 0"));
    }
    Ok(())
}
