//! Fixed-format date rendering for the `:date[..]` token.
//!
//! All three shapes are UTC with hard-coded English names and a literal
//! offset, so the host's locale and timezone never leak into log lines.

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

/// Common log format: `06/Aug/2026:01:02:03 +0000`.
const CLF: &[BorrowedFormatItem<'static>] =
    format_description!("[day]/[month repr:short]/[year]:[hour]:[minute]:[second] +0000");

/// RFC 1123: `Wed, 06 Aug 2026 01:02:03 GMT`.
const WEB: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub(crate) fn clf(when: OffsetDateTime) -> Option<String> {
    when.format(CLF).ok()
}

pub(crate) fn web(when: OffsetDateTime) -> Option<String> {
    when.format(WEB).ok()
}

pub(crate) fn iso(when: OffsetDateTime) -> Option<String> {
    when.format(&Rfc3339).ok()
}
