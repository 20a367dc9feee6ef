use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::model::Ms;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_FACILITIES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PLATE_LEN: usize = 16;
pub const MAX_CLASS_CAPACITY: u32 = 100_000;

pub const MAX_GRANT_HOURS: Decimal = dec!(24);
pub const MAX_SETTLEMENT_GRANTS: usize = 100_000;
