//! CSV line handling and product row validation.
//!
//! Fields are comma-delimited. A `"` toggles quoted mode, where commas are literal; doubled
//! quotes are not treated as escapes.

use thiserror::Error;

pub const NAME_REQUIRED: &str = "Name is required";
pub const PRICE_INVALID: &str = "Price must be a positive number";
pub const STOCK_INVALID: &str = "Stock must be a non-negative number";
pub const CATEGORY_REQUIRED: &str = "Category is required";
pub const DESCRIPTION_REQUIRED: &str = "Description is required";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("CSV file is empty")]
    Empty,
    #[error("CSV header must include name and price columns")]
    MissingRequiredColumns,
}

/// Normalizes `\r\n` and bare `\r` to `\n` and splits into lines.
///
/// A single trailing newline does not produce an extra line.
pub fn split_lines(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let body = normalized.strip_suffix('\n').unwrap_or(&normalized);
    if body.is_empty() {
        return Vec::new();
    }
    body.split('\n').map(str::to_string).collect()
}

/// Splits one line into trimmed fields. Quote characters are dropped.
pub fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Positions of the known product columns in the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMap {
    name: usize,
    price: usize,
    description: Option<usize>,
    category: Option<usize>,
    stock: Option<usize>,
    image_url: Option<usize>,
}

impl HeaderMap {
    /// Maps a header line. Column names are matched case-insensitively.
    pub fn parse(header_line: &str) -> Result<Self, HeaderError> {
        let header_line = header_line.trim_start_matches('\u{feff}');
        if header_line.trim().is_empty() {
            return Err(HeaderError::Empty);
        }

        let columns: Vec<String> = parse_line(header_line)
            .into_iter()
            .map(|column| column.to_ascii_lowercase())
            .collect();
        let find = |names: &[&str]| columns.iter().position(|c| names.contains(&c.as_str()));

        let (Some(name), Some(price)) = (find(&["name"]), find(&["price"])) else {
            return Err(HeaderError::MissingRequiredColumns);
        };
        Ok(Self {
            name,
            price,
            description: find(&["description"]),
            category: find(&["category"]),
            stock: find(&["stock"]),
            image_url: find(&["imageurl", "image_url"]),
        })
    }
}

/// A row that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductCandidate {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category: String,
    pub stock: i32,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// Every field is empty. Counted as processed, never as an error.
    Blank,
    Valid(ProductCandidate),
    /// Validation messages joined with `"; "`.
    Invalid(String),
}

pub fn validate_row(header: &HeaderMap, line: &str) -> RowOutcome {
    let fields = parse_line(line);
    if fields.iter().all(|field| field.is_empty()) {
        return RowOutcome::Blank;
    }

    let field = |index: Option<usize>| -> &str {
        index
            .and_then(|i| fields.get(i))
            .map(String::as_str)
            .unwrap_or("")
    };

    let name = field(Some(header.name));
    let description = field(header.description);
    let category = field(header.category);
    let image_url = field(header.image_url);

    let mut problems = Vec::new();
    if name.is_empty() {
        problems.push(NAME_REQUIRED);
    }
    let price = parse_price(field(Some(header.price)));
    if price.is_none() {
        problems.push(PRICE_INVALID);
    }
    let stock = parse_stock(field(header.stock));
    if stock.is_none() {
        problems.push(STOCK_INVALID);
    }
    if category.is_empty() {
        problems.push(CATEGORY_REQUIRED);
    }
    if description.is_empty() {
        problems.push(DESCRIPTION_REQUIRED);
    }

    match (price, stock) {
        (Some(price), Some(stock)) if problems.is_empty() => RowOutcome::Valid(ProductCandidate {
            name: name.to_string(),
            description: description.to_string(),
            price,
            category: category.to_string(),
            stock,
            image_url: (!image_url.is_empty()).then(|| image_url.to_string()),
        }),
        _ => RowOutcome::Invalid(problems.join("; ")),
    }
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|price| price.is_finite() && *price > 0.0)
}

/// Empty stock means zero; fractional values are truncated.
fn parse_stock(raw: &str) -> Option<i32> {
    if raw.is_empty() {
        return Some(0);
    }
    let stock = raw.parse::<f64>().ok()?;
    if !stock.is_finite() || stock < 0.0 {
        return None;
    }
    Some(stock.trunc().min(f64::from(i32::MAX)) as i32)
}
