//! Fixed-point units
//!
//! Prices carry 8 implied decimals (`6_000_000_000_000` = 60000.00000000).
//! Stake amounts carry 18 implied decimals, like the native coin they escrow.

/// Implied decimals of every price handled by the game.
pub const PRICE_DECIMALS: u32 = 8;
/// Implied decimals of staked / pooled amounts.
pub const AMOUNT_DECIMALS: u32 = 18;

/// Fixed-point price with [`PRICE_DECIMALS`] implied decimals.
pub type PriceE8 = u128;
/// Fixed-point amount with [`AMOUNT_DECIMALS`] implied decimals.
pub type Amount = u128;

/// Rescale a raw oracle answer with `decimals` places to [`PRICE_DECIMALS`].
///
/// Returns `None` for non-positive answers or on overflow. Extra precision is truncated.
pub fn normalize_answer(answer: i128, decimals: u32) -> Option<PriceE8> {
    if answer <= 0 {
        return None;
    }
    let raw = answer as u128;
    if decimals == PRICE_DECIMALS {
        Some(raw)
    } else if decimals < PRICE_DECIMALS {
        let factor = 10u128.checked_pow(PRICE_DECIMALS - decimals)?;
        raw.checked_mul(factor)
    } else {
        let factor = 10u128.checked_pow(decimals - PRICE_DECIMALS)?;
        let scaled = raw / factor;
        (scaled > 0).then_some(scaled)
    }
}

/// Parse a decimal string ("61000.5", "0.01", "1,234.56") into a fixed-point integer.
pub fn parse_fixed(input: &str, decimals: u32) -> Option<u128> {
    let cleaned: String = input.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || cleaned.starts_with('-') {
        return None;
    }

    let (whole, frac) = match cleaned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (cleaned.as_str(), ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let scale = 10u128.checked_pow(decimals)?;
    let whole_value: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };

    // Truncate precision beyond `decimals`.
    let frac_digits: String = frac.chars().take(decimals as usize).collect();
    let frac_value: u128 = if frac_digits.is_empty() {
        0
    } else {
        let padding = decimals - frac_digits.len() as u32;
        frac_digits.parse::<u128>().ok()?.checked_mul(10u128.checked_pow(padding)?)?
    };

    whole_value.checked_mul(scale)?.checked_add(frac_value)
}

/// Format a fixed-point integer with every implied decimal ("61000.00000000").
pub fn format_fixed(value: u128, decimals: u32) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let scale = 10u128.pow(decimals);
    format!(
        "{}.{:0width$}",
        value / scale,
        value % scale,
        width = decimals as usize
    )
}

/// Format with trailing zeros trimmed ("0.03" rather than "0.030000000000000000").
pub fn format_trimmed(value: u128, decimals: u32) -> String {
    let full = format_fixed(value, decimals);
    if !full.contains('.') {
        return full;
    }
    let trimmed = full.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

pub fn format_price(price: PriceE8) -> String {
    format_fixed(price, PRICE_DECIMALS)
}

pub fn format_amount(amount: Amount) -> String {
    format_trimmed(amount, AMOUNT_DECIMALS)
}

/// Convert a whole-coin decimal string to an [`Amount`].
pub fn parse_amount(input: &str) -> Option<Amount> {
    parse_fixed(input, AMOUNT_DECIMALS)
}
