//! Locale-tolerant numeric coercion for supplier cells

/// Parse a decimal cell such as a price, weight or volume
///
/// Accepts currency symbols and whitespace around the number, thousands
/// commas (`1,234,567.50`), a European decimal comma (`12,50`) and the mixed
/// form (`1.234,56`). Returns `None` when nothing numeric is left.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        // Whichever separator comes last is the decimal point
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = cleaned.len() - comma - 1;
            if cleaned.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        },
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a quantity cell; anything unparsable counts as zero stock
///
/// The cell goes through [`parse_decimal`] first, so separators read the same
/// as in prices: `"1,234"` is 1234 and `"12.7"` / `"12,7"` truncate to 12.
/// Stock is never negative, so `"-3"` is 0. Cells the decimal parser rejects
/// fall back to their digits alone (`"5 pcs"` is 5, `">100"` is 100).
pub fn parse_quantity(raw: &str) -> i64 {
    if let Some(value) = parse_decimal(raw) {
        if value <= 0.0 {
            return 0;
        }
        if value < i64::MAX as f64 {
            return value.trunc() as i64;
        }
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// First run of digits in the cell, e.g. `"3-5 days"` is 3
pub fn parse_integer(raw: &str) -> Option<i64> {
    let digits: String = raw
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Currency implied by a symbol inside a price cell
pub fn currency_from_symbol(raw: &str) -> Option<&'static str> {
    if raw.contains('$') {
        Some("USD")
    } else if raw.contains('€') {
        Some("EUR")
    } else if raw.contains('£') {
        Some("GBP")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_symbol_prices() {
        assert_eq!(parse_decimal("10.50"), Some(10.5));
        assert_eq!(parse_decimal("$ 20"), Some(20.0));
        assert_eq!(parse_decimal("AED 1,250.75"), Some(1250.75));
        assert_eq!(parse_decimal("€12,5"), Some(12.5));
    }

    #[test]
    fn test_separator_forms() {
        assert_eq!(parse_decimal("1.234,56"), Some(1234.56));
        assert_eq!(parse_decimal("1,234"), Some(1234.0));
        assert_eq!(parse_decimal("1,234,567"), Some(1234567.0));
        assert_eq!(parse_decimal("12,34"), Some(12.34));
        assert_eq!(parse_decimal("1.234.567"), Some(1234567.0));
    }

    #[test]
    fn test_unparsable_prices_are_none() {
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("n/a"), None);
        assert_eq!(parse_decimal("call"), None);
        assert_eq!(parse_decimal("--"), None);
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("5"), 5);
        assert_eq!(parse_quantity("1,234"), 1234);
        assert_eq!(parse_quantity("5 pcs"), 5);
        assert_eq!(parse_quantity(">100"), 100);
        assert_eq!(parse_quantity("-3"), 0);
        assert_eq!(parse_quantity("12.7"), 12);
        assert_eq!(parse_quantity("12,7"), 12);
        assert_eq!(parse_quantity("-3 pcs"), 0);
        assert_eq!(parse_quantity("+7"), 7);
        assert_eq!(parse_quantity("none"), 0);
        assert_eq!(parse_quantity(""), 0);
    }

    #[test]
    fn test_integers() {
        assert_eq!(parse_integer("3-5 days"), Some(3));
        assert_eq!(parse_integer("14"), Some(14));
        assert_eq!(parse_integer(""), None);
        assert_eq!(parse_integer("ask"), None);
    }

    #[test]
    fn test_currency_symbols() {
        assert_eq!(currency_from_symbol("$10"), Some("USD"));
        assert_eq!(currency_from_symbol("10 €"), Some("EUR"));
        assert_eq!(currency_from_symbol("£3.20"), Some("GBP"));
        assert_eq!(currency_from_symbol("10.00"), None);
    }
}
