//! Header-to-field resolution
//!
//! Supplier exports name their columns however they like. Headers are matched
//! case-insensitively against an ordered alias table after caller overrides
//! have claimed their columns; each header maps to at most one field.

use std::collections::BTreeMap;

use crate::models::Field;

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Exact(&'static str),
    Contains(&'static str),
}

impl Pattern {
    fn matches(&self, header: &str) -> bool {
        match self {
            Pattern::Exact(name) => header == *name,
            Pattern::Contains(fragment) => header.contains(fragment),
        }
    }
}

use Pattern::{Contains, Exact};

/// Fields in claim priority order with their aliases
const ALIASES: &[(Field, &[Pattern])] = &[
    (
        Field::PartNumber,
        &[
            Contains("vendor code"),
            Contains("vendor_code"),
            Exact("partnumber"),
            Exact("part number"),
            Exact("part_number"),
            Exact("part no"),
            Exact("part no."),
            Exact("part #"),
            Exact("pn"),
            Exact("mpn"),
            Exact("sku"),
            Exact("code"),
            Exact("item number"),
            Exact("item #"),
            Exact("item code"),
            Exact("product code"),
        ],
    ),
    (
        Field::Description,
        &[Contains("title"), Contains("desc"), Exact("name"), Exact("product name")],
    ),
    (
        Field::Brand,
        &[Contains("brand"), Exact("manufacturer"), Exact("make"), Exact("mfr")],
    ),
    (Field::Supplier, &[Contains("supplier"), Exact("vendor")]),
    (Field::Price, &[Contains("price"), Contains("cost")]),
    (
        Field::Currency,
        &[Contains("currency"), Contains("curr"), Exact("aed"), Exact("usd")],
    ),
    (
        Field::Quantity,
        &[
            Exact("quantity"),
            Exact("qty"),
            Exact("stock qty"),
            Exact("qty available"),
            Exact("available"),
            Exact("on hand"),
        ],
    ),
    (
        Field::MinOrderQty,
        &[
            Contains("min_lot"),
            Contains("min lot"),
            Contains("minorder"),
            Contains("min_order"),
            Contains("min order"),
            Exact("moq"),
            Exact("minimum order"),
        ],
    ),
    (Field::Stock, &[Exact("stock"), Exact("availability"), Exact("stock status")]),
    (
        Field::StockCode,
        &[
            Contains("stock code"),
            Contains("stock_code"),
            Contains("stockcode"),
            Exact("warehouse"),
        ],
    ),
    (
        Field::WeightUnit,
        &[Contains("weight_unit"), Contains("weightunit"), Contains("weight unit")],
    ),
    (Field::Weight, &[Exact("weight"), Exact("net weight"), Exact("weight kg")]),
    (Field::Volume, &[Contains("volume"), Exact("vol")]),
    (
        Field::DeliveryDays,
        &[
            Contains("delivery"),
            Contains("lead_time"),
            Contains("leadtime"),
            Contains("lead time"),
        ],
    ),
    (
        Field::Origin,
        &[Exact("origin"), Contains("country of origin"), Exact("coo")],
    ),
    (
        Field::Subcategory,
        &[
            Contains("subcategory"),
            Contains("subcat"),
            Contains("sub_category"),
            Contains("sub category"),
        ],
    ),
    (Field::Category, &[Exact("category"), Exact("cat")]),
];

/// Lowercased, trimmed header with quotes and a UTF-8 BOM removed
pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim()
        .to_lowercase()
}

/// Resolved column index for every recognized field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnLayout {
    columns: BTreeMap<Field, usize>,
}

impl ColumnLayout {
    pub fn resolve(headers: &[String], overrides: &BTreeMap<Field, String>) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let mut claimed = vec![false; normalized.len()];
        let mut columns = BTreeMap::new();

        for (field, source_header) in overrides {
            let wanted = normalize_header(source_header);
            if let Some(idx) = normalized
                .iter()
                .enumerate()
                .position(|(i, h)| !claimed[i] && *h == wanted)
            {
                claimed[idx] = true;
                columns.insert(*field, idx);
            }
        }

        for (idx, header) in normalized.iter().enumerate() {
            if claimed[idx] || header.is_empty() {
                continue;
            }
            let field = ALIASES.iter().find(|(field, patterns)| {
                !columns.contains_key(field) && patterns.iter().any(|p| p.matches(header))
            });
            if let Some((field, _)) = field {
                claimed[idx] = true;
                columns.insert(*field, idx);
            }
        }

        Self { columns }
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    pub fn has(&self, field: Field) -> bool {
        self.columns.contains_key(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (Field, usize)> + '_ {
        self.columns.iter().map(|(f, i)| (*f, *i))
    }
}
