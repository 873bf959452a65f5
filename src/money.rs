//! Integer cents are the unit of truth for balances; credits are a display
//! scaling of cents (1 credit = 100 cents).

pub const CENTS_PER_CREDIT: i64 = 100;

/// Round half away from zero to whole cents.
#[inline]
pub fn credits_to_cents(credits: f64) -> i64 {
    (credits * CENTS_PER_CREDIT as f64).round() as i64
}

#[inline]
pub fn cents_to_credits(cents: i64) -> f64 {
    cents as f64 / CENTS_PER_CREDIT as f64
}

/// `1234567` -> `"12,345.67"`, `-5` -> `"-0.05"`
pub fn format_credits(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let whole = abs / CENTS_PER_CREDIT as u64;
    let frac = abs % CENTS_PER_CREDIT as u64;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{sign}{grouped}.{frac:02}")
}
