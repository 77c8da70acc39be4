//! Pack catalog and price computation.
//!
//! One coin costs R$ 1,00. Each pack carries a discount fraction and the
//! final charge is always rounded *up* to the nearest R$ 0,50, so the shop
//! never loses fractional revenue to rounding. The same function prices the
//! pack button label and the charge sent to the gateway, so both always
//! agree.

use rust_decimal::Decimal;

/// Base price of a single coin, in BRL.
pub const COIN_BASE_BRL: Decimal = Decimal::ONE;

/// A purchasable coin pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pack {
    pub id: &'static str,
    pub coins: i32,
    /// Discount as basis points of 1 (e.g. 50 = 0.5%).
    discount_bp: u32,
}

impl Pack {
    /// Discount fraction in [0, 1).
    pub fn discount(&self) -> Decimal {
        Decimal::new(self.discount_bp as i64, 4)
    }
}

/// The fixed catalog sold by the shop.
pub const PACKS: [Pack; 6] = [
    Pack { id: "c5", coins: 5, discount_bp: 0 },
    Pack { id: "c10", coins: 10, discount_bp: 50 },
    Pack { id: "c25", coins: 25, discount_bp: 100 },
    Pack { id: "c50", coins: 50, discount_bp: 150 },
    Pack { id: "c100", coins: 100, discount_bp: 250 },
    Pack { id: "c500", coins: 500, discount_bp: 500 },
];

/// Looks up a pack by its catalog id.
pub fn find_pack(pack_id: &str) -> Option<&'static Pack> {
    PACKS.iter().find(|p| p.id == pack_id)
}

/// Rounds a value up to the next multiple of 0.50.
fn round_up_to_half(value: Decimal) -> Decimal {
    let doubled = value * Decimal::TWO;
    let ceiled = doubled.ceil();
    (ceiled / Decimal::TWO).normalize()
}

/// Final charge amount for a pack.
pub fn price(pack: &Pack) -> Decimal {
    let base = Decimal::from(pack.coins) * COIN_BASE_BRL;
    let discounted = base * (Decimal::ONE - pack.discount());
    round_up_to_half(discounted)
}

/// Formats an amount the way customers see it: `R$ 9,50`.
pub fn format_brl(amount: Decimal) -> String {
    format!("R$ {:.2}", amount).replace('.', ",")
}
