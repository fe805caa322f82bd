use rust_decimal::Decimal;

/// Fixed-point currency value. The wire carries plain JSON numbers;
/// arithmetic on this side is exact.
pub type Value = Decimal;

pub type AccountNo = String;
pub type TxId = String;
