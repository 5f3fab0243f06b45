use common::ErrorKind;
use reader::RowRecord;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

/// The full header set an input file must carry.
pub const REQUIRED_HEADERS: [&str; 9] = [
    "employee_number",
    "first_name",
    "last_name",
    "email",
    "department",
    "salary",
    "currency",
    "country_code",
    "start_date",
];

pub const CURRENCIES: [&str; 8] = ["KES", "USD", "ZAR", "NGN", "GHS", "UGX", "RWF", "TZS"];
pub const COUNTRY_CODES: [&str; 7] = ["KE", "NG", "GH", "UG", "ZA", "TZ", "RW"];

/// Fields the cache key is derived from, in canonical order.
const CACHE_FIELDS: [&str; 9] = REQUIRED_HEADERS;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+'-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+$").expect("email regex")
});

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date regex"));

/// One failed rule. Messages are stable strings downstream consumers match
/// on by prefix, so they change only deliberately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Violation {
    pub kind: ErrorKind,
    pub message: &'static str,
}

impl Violation {
    const fn validation(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message,
        }
    }

    const fn business_rule(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::BusinessRule,
            message,
        }
    }
}

struct CachedVerdict {
    violations: Vec<Violation>,
    cached_at: Instant,
}

/// Stateless per-record rule chain with a small keyed result cache.
///
/// Identical rows (common in bulk exports) hit the cache instead of
/// re-running the regex work. The key is a SHA-256 over the canonical field
/// tuple so equal-after-trim rows share a verdict.
pub struct RecordValidator {
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedVerdict>>,
}

impl RecordValidator {
    /// A TTL of zero disables the cache entirely.
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn validate(&self, record: &RowRecord) -> Vec<Violation> {
        if self.cache_ttl.is_zero() {
            return validate_record(record);
        }

        let key = cache_key(record);
        if let Ok(cache) = self.cache.lock()
            && let Some(hit) = cache.get(&key)
            && hit.cached_at.elapsed() < self.cache_ttl
        {
            return hit.violations.clone();
        }

        let violations = validate_record(record);
        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() > 4096 {
                cache.clear();
            }
            cache.insert(
                key,
                CachedVerdict {
                    violations: violations.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        violations
    }
}

fn cache_key(record: &RowRecord) -> String {
    let mut hasher = Sha256::new();
    for field in CACHE_FIELDS {
        hasher.update(record.get_trimmed(field).unwrap_or_default().as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// The rule chain. Presence failures short-circuit; everything after
/// accumulates so one bad row reports all of its problems at once.
fn validate_record(record: &RowRecord) -> Vec<Violation> {
    let mut violations = Vec::new();

    let employee_number = record.get_trimmed("employee_number");
    if employee_number.is_none() {
        violations.push(Violation::validation("employee_number is required"));
    }
    if record.get_trimmed("first_name").is_none() {
        violations.push(Violation::validation("first_name is required"));
    }
    if record.get_trimmed("last_name").is_none() {
        violations.push(Violation::validation("last_name is required"));
    }
    let email = record.get_trimmed("email");
    if email.is_none() {
        violations.push(Violation::validation("email is required"));
    }
    if !violations.is_empty() {
        return violations;
    }

    if let Some(email) = email
        && !is_valid_email(email)
    {
        violations.push(Violation::validation("email must be a valid email address"));
    }

    if let Some(number) = employee_number
        && number.chars().count() > 50
    {
        violations.push(Violation::validation(
            "employee_number must not exceed 50 characters",
        ));
    }

    if let Some(salary) = record.get_trimmed("salary") {
        match parse_salary(salary) {
            SalaryCheck::NotNumeric => {
                violations.push(Violation::validation("salary must be a positive number"))
            }
            SalaryCheck::NotPositive => violations.push(Violation::business_rule(
                "salary must be a positive number",
            )),
            SalaryCheck::Ok(_) => {}
        }
    }

    if let Some(currency) = record.get_trimmed("currency")
        && !CURRENCIES.contains(&currency)
    {
        violations.push(Violation::validation(
            "currency must be one of KES, USD, ZAR, NGN, GHS, UGX, RWF, TZS",
        ));
    }

    if let Some(country) = record.get_trimmed("country_code")
        && !COUNTRY_CODES.contains(&country)
    {
        violations.push(Violation::validation(
            "country_code must be one of KE, NG, GH, UG, ZA, TZ, RW",
        ));
    }

    if let Some(date) = record.get_trimmed("start_date") {
        match check_start_date(date) {
            DateCheck::Malformed => violations.push(Violation::validation(
                "start_date must be a valid date in YYYY-MM-DD format",
            )),
            DateCheck::Future => violations.push(Violation::business_rule(
                "start_date must not be in the future",
            )),
            DateCheck::Ok => {}
        }
    }

    if let Some(department) = record.get_trimmed("department")
        && department.chars().count() > 100
    {
        violations.push(Violation::validation(
            "department must not exceed 100 characters",
        ));
    }

    violations
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().filter(|c| *c == '@').count() != 1 {
        return false;
    }
    let Some((_, domain)) = email.split_once('@') else {
        return false;
    };
    domain.len() >= 3 && domain.contains('.') && EMAIL_RE.is_match(email)
}

enum SalaryCheck {
    Ok(f64),
    NotNumeric,
    NotPositive,
}

/// Strictly positive decimal. Anything with a letter in it ("50k", "1e3")
/// is rejected before the parse so exponent notation cannot sneak through.
fn parse_salary(raw: &str) -> SalaryCheck {
    if raw.chars().any(|c| c.is_alphabetic()) {
        return SalaryCheck::NotNumeric;
    }
    match raw.parse::<f64>() {
        Ok(value) if value > 0.0 => SalaryCheck::Ok(value),
        Ok(_) => SalaryCheck::NotPositive,
        Err(_) => SalaryCheck::NotNumeric,
    }
}

enum DateCheck {
    Ok,
    Malformed,
    Future,
}

fn check_start_date(raw: &str) -> DateCheck {
    if !DATE_RE.is_match(raw) {
        return DateCheck::Malformed;
    }
    match chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) if date > chrono::Utc::now().date_naive() => DateCheck::Future,
        Ok(_) => DateCheck::Ok,
        Err(_) => DateCheck::Malformed,
    }
}
