// ── SIM identity resolution ──
//
// Splits an IMSI into MCC/MNC and maps the pair onto a small catalog of
// known networks with their self-care USSD codes. The split is the only
// subtle part: most networks use two-digit MNCs, but a fixed set of
// countries allocates three digits.

use serde::{Deserialize, Serialize};

/// MCCs whose networks use three-digit MNCs.
#[rustfmt::skip]
const THREE_DIGIT_MNC_MCC: &[&str] = &[
    "365", "344", "722", "364", "342", "350", "348", "302", "346", "732",
    "366", "750", "262", "352", "310", "311", "708", "404", "405", "338",
    "467", "502", "334", "354", "362", "242", "714", "330", "356", "358",
    "360", "374", "376", "312", "316",
];

/// Service codes an operator publishes for self-care queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UssdShortcuts {
    /// Balance enquiry code.
    pub balance: Option<String>,
    /// Own-number enquiry code.
    pub own_number: Option<String>,
}

/// What the IMSI tells us about the inserted SIM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSim {
    pub imsi: String,
    pub mcc: String,
    pub mnc: String,
    pub country: Option<String>,
    /// ISO 3166-1 alpha-2 country code.
    pub iso: Option<String>,
    pub operator: Option<String>,
    pub shortcuts: UssdShortcuts,
}

struct CountryEntry {
    mcc: &'static str,
    country: &'static str,
    iso: &'static str,
}

const COUNTRIES: &[CountryEntry] = &[
    CountryEntry { mcc: "250", country: "Russia", iso: "RU" },
    CountryEntry { mcc: "255", country: "Ukraine", iso: "UA" },
    CountryEntry { mcc: "257", country: "Belarus", iso: "BY" },
    CountryEntry { mcc: "401", country: "Kazakhstan", iso: "KZ" },
    CountryEntry { mcc: "262", country: "Germany", iso: "DE" },
    CountryEntry { mcc: "310", country: "United States", iso: "US" },
    CountryEntry { mcc: "311", country: "United States", iso: "US" },
    CountryEntry { mcc: "302", country: "Canada", iso: "CA" },
    CountryEntry { mcc: "404", country: "India", iso: "IN" },
    CountryEntry { mcc: "405", country: "India", iso: "IN" },
];

struct OperatorEntry {
    mcc: &'static str,
    mnc: &'static str,
    name: &'static str,
    balance: &'static str,
    own_number: &'static str,
}

const OPERATORS: &[OperatorEntry] = &[
    OperatorEntry {
        mcc: "250",
        mnc: "01",
        name: "MTS",
        balance: "*100#",
        own_number: "*111*0887#",
    },
    OperatorEntry {
        mcc: "250",
        mnc: "02",
        name: "MegaFon",
        balance: "*100#",
        own_number: "*205#",
    },
    OperatorEntry {
        mcc: "250",
        mnc: "20",
        name: "Tele2",
        balance: "*105#",
        own_number: "*201#",
    },
    OperatorEntry {
        mcc: "250",
        mnc: "99",
        name: "Beeline",
        balance: "*102#",
        own_number: "*110*10#",
    },
];

/// Resolve an IMSI into MCC, MNC, and (when cataloged) country and
/// operator. Returns `None` for strings that cannot be an IMSI.
pub fn resolve_sim(imsi: &str) -> Option<ResolvedSim> {
    if imsi.len() < 10 || imsi.len() > 15 || !imsi.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mcc = &imsi[..3];
    let mnc_len = if THREE_DIGIT_MNC_MCC.contains(&mcc) {
        3
    } else {
        2
    };
    let mnc = &imsi[3..3 + mnc_len];

    let country = COUNTRIES.iter().find(|c| c.mcc == mcc);
    let operator = OPERATORS
        .iter()
        .find(|op| op.mcc == mcc && op.mnc == mnc);

    Some(ResolvedSim {
        imsi: imsi.to_owned(),
        mcc: mcc.to_owned(),
        mnc: mnc.to_owned(),
        country: country.map(|c| c.country.to_owned()),
        iso: country.map(|c| c.iso.to_owned()),
        operator: operator.map(|op| op.name.to_owned()),
        shortcuts: operator
            .map(|op| UssdShortcuts {
                balance: Some(op.balance.to_owned()),
                own_number: Some(op.own_number.to_owned()),
            })
            .unwrap_or_default(),
    })
}
