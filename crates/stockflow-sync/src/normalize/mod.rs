//! Record normalization
//!
//! Turns raw supplier rows (CSV lines or API JSON objects) into canonical
//! [`PartRecord`]s. One [`NormalizeOutcome`] is produced per input row; rows
//! without a part number are rejected and counted, never raised as errors.

pub mod columns;
pub mod numeric;
pub mod stream;

pub use columns::ColumnLayout;
pub use stream::{ApiRecordStream, Batch, Batcher, CsvRecordStream, RecordStream};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Field, PartRecord, StockStatus};
use numeric::{currency_from_symbol, parse_decimal, parse_integer, parse_quantity};

pub const DEFAULT_WEIGHT_UNIT: &str = "kg";

/// Why a row did not become a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingPartNumber,
    MalformedRow(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Accepted(PartRecord),
    Rejected(RejectReason),
}

/// Per-file values stamped onto every record
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub integration_id: Uuid,
    pub integration_name: String,
    pub file_name: String,
    pub default_currency: String,
    pub default_supplier: Option<String>,
    pub low_stock_threshold: i64,
    /// Warehouse code taken from the file name, used when the row has none
    pub file_stock_code: Option<String>,
    pub imported_at: DateTime<Utc>,
}

impl NormalizeContext {
    pub fn new(integration_id: Uuid, integration_name: impl Into<String>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            integration_id,
            integration_name: integration_name.into(),
            file_stock_code: stock_code_from_file_name(&file_name),
            file_name,
            default_currency: crate::config::DEFAULT_CURRENCY.to_string(),
            default_supplier: None,
            low_stock_threshold: crate::config::DEFAULT_LOW_STOCK_THRESHOLD,
            imported_at: Utc::now(),
        }
    }

    pub fn with_defaults(
        mut self,
        default_currency: impl Into<String>,
        default_supplier: Option<String>,
        low_stock_threshold: i64,
    ) -> Self {
        self.default_currency = default_currency.into();
        self.default_supplier = default_supplier;
        self.low_stock_threshold = low_stock_threshold;
        self
    }
}

/// Warehouse code from names like `APMG price 1 day_DS1_part1.csv`
pub fn stock_code_from_file_name(file_name: &str) -> Option<String> {
    let end = file_name.rfind("_part")?;
    let before = &file_name[..end];
    let start = before.rfind('_')? + 1;
    let code = before[start..].trim();
    (!code.is_empty()).then(|| code.to_string())
}

/// Pick the most frequent delimiter on the first line; `,` when none appear
pub fn detect_delimiter(sample: &[u8]) -> u8 {
    const CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

    let first_line = sample.split(|b| *b == b'\n').next().unwrap_or(sample);
    let mut best = (b',', 0usize);
    for candidate in CANDIDATES {
        let count = first_line.iter().filter(|b| **b == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

fn cell<'a, S: AsRef<str>>(values: &'a [S], idx: Option<usize>) -> Option<&'a str> {
    let value = values.get(idx?)?.as_ref().trim();
    let value = value.trim_matches(|c: char| c == '"' || c == '\'').trim();
    (!value.is_empty()).then_some(value)
}

fn text<S: AsRef<str>>(values: &[S], idx: Option<usize>) -> Option<String> {
    cell(values, idx).map(str::to_string)
}

/// Maps raw row values onto the canonical schema
#[derive(Debug, Clone)]
pub struct Normalizer {
    context: NormalizeContext,
}

impl Normalizer {
    pub fn new(context: NormalizeContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &NormalizeContext {
        &self.context
    }

    /// Normalize one row whose values line up with `layout`
    pub fn normalize<S: AsRef<str>>(&self, layout: &ColumnLayout, values: &[S]) -> NormalizeOutcome {
        let ctx = &self.context;
        let get = |field: Field| cell(values, layout.get(field));

        let part_number = match get(Field::PartNumber) {
            Some(pn) => pn.to_string(),
            None => return NormalizeOutcome::Rejected(RejectReason::MissingPartNumber),
        };

        let price_raw = get(Field::Price);
        let price = price_raw.and_then(parse_decimal);
        let currency = get(Field::Currency)
            .map(|c| c.to_uppercase())
            .or_else(|| price_raw.and_then(currency_from_symbol).map(str::to_string))
            .unwrap_or_else(|| ctx.default_currency.clone());

        let stock_text = get(Field::Stock);
        let on_order = stock_text
            .map(|s| s.to_lowercase().contains("order"))
            .unwrap_or(false);
        let quantity = if layout.has(Field::Quantity) {
            Some(get(Field::Quantity).map(parse_quantity).unwrap_or(0))
        } else {
            stock_text.and_then(|s| parse_decimal(s).map(|_| parse_quantity(s)))
        };
        let stock_status = StockStatus::derive(quantity, on_order, ctx.low_stock_threshold);

        let min_order_qty = get(Field::MinOrderQty)
            .and_then(parse_integer)
            .unwrap_or(1)
            .max(1);

        let now = Utc::now();
        NormalizeOutcome::Accepted(PartRecord {
            part_number,
            description: text(values, layout.get(Field::Description)),
            brand: text(values, layout.get(Field::Brand)),
            supplier: text(values, layout.get(Field::Supplier)).or_else(|| ctx.default_supplier.clone()),
            price,
            currency,
            quantity: quantity.unwrap_or(0),
            stock_status,
            min_order_qty,
            stock_code: text(values, layout.get(Field::StockCode)).or_else(|| ctx.file_stock_code.clone()),
            origin: text(values, layout.get(Field::Origin)),
            weight: get(Field::Weight).and_then(parse_decimal),
            weight_unit: text(values, layout.get(Field::WeightUnit))
                .unwrap_or_else(|| DEFAULT_WEIGHT_UNIT.to_string()),
            volume: get(Field::Volume).and_then(parse_decimal),
            delivery_days: get(Field::DeliveryDays)
                .and_then(parse_integer)
                .and_then(|d| i32::try_from(d).ok()),
            category: text(values, layout.get(Field::Category)),
            subcategory: text(values, layout.get(Field::Subcategory)),
            integration_id: ctx.integration_id,
            integration_name: ctx.integration_name.clone(),
            file_name: ctx.file_name.clone(),
            imported_at: ctx.imported_at,
            last_updated: now,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn layout(names: &[&str]) -> ColumnLayout {
        let headers: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ColumnLayout::resolve(&headers, &BTreeMap::new())
    }

    fn accepted(outcome: NormalizeOutcome) -> PartRecord {
        match outcome {
            NormalizeOutcome::Accepted(record) => record,
            other => panic!("expected a record, got {:?}", other),
        }
    }

    fn normalizer(file_name: &str) -> Normalizer {
        Normalizer::new(NormalizeContext::new(Uuid::nil(), "Gulf Parts", file_name))
    }

    #[test]
    fn test_delimiter_detection() {
        assert_eq!(detect_delimiter(b"sku;price;qty\n1;2;3"), b';');
        assert_eq!(detect_delimiter(b"sku\tprice\tqty\n"), b'\t');
        assert_eq!(detect_delimiter(b"sku|price|qty"), b'|');
        assert_eq!(detect_delimiter(b"sku,price;qty,brand\n"), b',');
        assert_eq!(detect_delimiter(b"sku\n"), b',');
        assert_eq!(detect_delimiter(b""), b',');
    }

    #[test]
    fn test_stock_code_from_file_name() {
        assert_eq!(
            stock_code_from_file_name("APMG price 1 day_DS1_part1.csv").as_deref(),
            Some("DS1")
        );
        assert_eq!(stock_code_from_file_name("stock.csv"), None);
        assert_eq!(stock_code_from_file_name("feed_part2.csv"), None);
    }

    #[test]
    fn test_full_row() {
        let layout = layout(&["SKU", "Description", "Brand", "Price", "Qty", "MOQ", "Delivery", "Weight"]);
        let record = accepted(normalizer("gulf.csv").normalize(
            &layout,
            &["ABC-1", "Oil filter", "Bosch", "$10.50", "5", "0", "3-5 days", "1,5"],
        ));
        assert_eq!(record.part_number, "ABC-1");
        assert_eq!(record.price, Some(10.5));
        assert_eq!(record.currency, "USD");
        assert_eq!(record.quantity, 5);
        assert_eq!(record.stock_status, StockStatus::LowStock);
        assert_eq!(record.min_order_qty, 1);
        assert_eq!(record.delivery_days, Some(3));
        assert_eq!(record.weight, Some(1.5));
        assert_eq!(record.weight_unit, "kg");
        assert_eq!(record.file_name, "gulf.csv");
    }

    #[test]
    fn test_missing_part_number_is_rejected() {
        let layout = layout(&["sku", "price"]);
        let outcome = normalizer("a.csv").normalize(&layout, &["  ", "10"]);
        assert_eq!(outcome, NormalizeOutcome::Rejected(RejectReason::MissingPartNumber));
    }

    #[test]
    fn test_currency_precedence() {
        let layout = layout(&["sku", "price", "currency"]);
        let n = normalizer("a.csv");
        assert_eq!(accepted(n.normalize(&layout, &["A", "€5", "usd"])).currency, "USD");
        assert_eq!(accepted(n.normalize(&layout, &["A", "€5", ""])).currency, "EUR");
        assert_eq!(accepted(n.normalize(&layout, &["A", "5", ""])).currency, "AED");
    }

    #[test]
    fn test_stock_status_without_quantity_column() {
        let n = normalizer("a.csv");
        let no_qty = layout(&["sku", "price"]);
        assert_eq!(accepted(n.normalize(&no_qty, &["A", "1"])).stock_status, StockStatus::Unknown);

        let stock_text = layout(&["sku", "stock"]);
        let record = accepted(n.normalize(&stock_text, &["A", "On order"]));
        assert_eq!(record.stock_status, StockStatus::OnOrder);
        let record = accepted(n.normalize(&stock_text, &["A", "40"]));
        assert_eq!(record.quantity, 40);
        assert_eq!(record.stock_status, StockStatus::InStock);
    }

    #[test]
    fn test_empty_quantity_cell_is_out_of_stock() {
        let layout = layout(&["sku", "qty"]);
        let record = accepted(normalizer("a.csv").normalize(&layout, &["A", ""]));
        assert_eq!(record.quantity, 0);
        assert_eq!(record.stock_status, StockStatus::OutOfStock);
    }

    #[test]
    fn test_stock_code_falls_back_to_file_name() {
        let layout = layout(&["sku", "stock code"]);
        let n = normalizer("feed_DXB_part3.csv");
        assert_eq!(accepted(n.normalize(&layout, &["A", ""])).stock_code.as_deref(), Some("DXB"));
        assert_eq!(accepted(n.normalize(&layout, &["A", "SHJ"])).stock_code.as_deref(), Some("SHJ"));
    }

    #[test]
    fn test_short_rows_leave_fields_empty() {
        let layout = layout(&["sku", "description", "price"]);
        let record = accepted(normalizer("a.csv").normalize(&layout, &["A"]));
        assert_eq!(record.description, None);
        assert_eq!(record.price, None);
    }
}
