// ── Unsolicited result codes ──
//
// Lines the modem volunteers outside any command/response cycle. Each
// incoming line is tested against a fixed-priority table of pure parsers
// before it is allowed into the response buffer; a match is published on
// the engine's broadcast channel instead.

/// An asynchronous notification from the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsolicitedEvent {
    /// Huawei sticks report supply problems out of band.
    VoltageWarning,
    /// Incoming voice call.
    Ring,
    /// New message stored; payload is the raw `<mem>,<index>` tail.
    NewMessageIndex(String),
    /// `+CPIN: NOT ...` — SIM missing or locked.
    SimError(String),
    /// Signal strength report.
    SignalLevel(String),
    /// Network operator notice (`+ZOPERTER:`).
    NetworkNotice(String),
    /// USSD session result, correlated by the operation layer.
    UssdResult {
        code: u8,
        text: String,
        length: u32,
    },
}

type EventParser = fn(&str) -> Option<UnsolicitedEvent>;

/// Fixed priority order: first match wins and short-circuits buffering.
const EVENT_TABLE: &[EventParser] = &[
    parse_voltage_warning,
    parse_ring,
    parse_cmti,
    parse_cpin,
    parse_rssi,
    parse_zoperter,
    parse_cusd,
];

/// Classify a received line against the event table.
pub fn classify(line: &str) -> Option<UnsolicitedEvent> {
    EVENT_TABLE.iter().find_map(|parse| parse(line))
}

// ── Parsers ──────────────────────────────────────────────────────────

fn parse_voltage_warning(line: &str) -> Option<UnsolicitedEvent> {
    // Firmware spelling, kept verbatim.
    line.eq_ignore_ascii_case("OVER-VOLTAGE WARNNING")
        .then_some(UnsolicitedEvent::VoltageWarning)
}

fn parse_ring(line: &str) -> Option<UnsolicitedEvent> {
    line.eq_ignore_ascii_case("RING")
        .then_some(UnsolicitedEvent::Ring)
}

fn parse_cmti(line: &str) -> Option<UnsolicitedEvent> {
    tail(line, "+CMTI:").map(|t| UnsolicitedEvent::NewMessageIndex(t.to_owned()))
}

fn parse_cpin(line: &str) -> Option<UnsolicitedEvent> {
    let t = tail(line, "+CPIN:")?;
    t.starts_with("NOT")
        .then(|| UnsolicitedEvent::SimError(t.to_owned()))
}

fn parse_rssi(line: &str) -> Option<UnsolicitedEvent> {
    tail(line, "RSSI:").map(|t| UnsolicitedEvent::SignalLevel(t.to_owned()))
}

fn parse_zoperter(line: &str) -> Option<UnsolicitedEvent> {
    tail(line, "+ZOPERTER:").map(|t| UnsolicitedEvent::NetworkNotice(t.to_owned()))
}

/// `+CUSD: <code>,"<hex text>",<dcs>`
fn parse_cusd(line: &str) -> Option<UnsolicitedEvent> {
    let t = tail(line, "+CUSD:")?;
    let code: u8 = t.split(',').next()?.trim().parse().ok()?;

    let open = t.find('"')?;
    let close = t[open + 1..].find('"')? + open + 1;
    let text = t[open + 1..close].to_owned();

    let length: u32 = t[close + 1..]
        .trim_start_matches(',')
        .trim()
        .parse()
        .ok()?;

    Some(UnsolicitedEvent::UssdResult { code, text, length })
}

// Garbled serial data is ordinary input here, so the split must tolerate
// a prefix boundary landing inside a multi-byte character.
fn tail<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let (head, rest) = line.split_at_checked(prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| rest.trim())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ring_matches_case_insensitively() {
        assert_eq!(classify("RING"), Some(UnsolicitedEvent::Ring));
        assert_eq!(classify("ring"), Some(UnsolicitedEvent::Ring));
    }

    #[test]
    fn cmti_carries_storage_and_index() {
        assert_eq!(
            classify("+CMTI: \"ME\",3"),
            Some(UnsolicitedEvent::NewMessageIndex("\"ME\",3".into()))
        );
    }

    #[test]
    fn cpin_only_matches_fault_states() {
        assert_eq!(
            classify("+CPIN: NOT INSERTED"),
            Some(UnsolicitedEvent::SimError("NOT INSERTED".into()))
        );
        // A READY report is command output, not an event.
        assert_eq!(classify("+CPIN: READY"), None);
    }

    #[test]
    fn cusd_extracts_code_text_and_length() {
        assert_eq!(
            classify("+CUSD: 0,\"00480069\",72"),
            Some(UnsolicitedEvent::UssdResult {
                code: 0,
                text: "00480069".into(),
                length: 72,
            })
        );
    }

    #[test]
    fn response_lines_do_not_classify() {
        assert_eq!(classify("OK"), None);
        assert_eq!(classify("+CPMS: \"SM\",5,50"), None);
        assert_eq!(classify("250026153286173"), None);
    }

    #[test]
    fn garbled_lines_do_not_classify() {
        // Line noise can put a multi-byte character anywhere, including
        // right where a prefix comparison would slice.
        assert_eq!(classify("+CMTIé"), None);
        assert_eq!(classify("é"), None);
        assert_eq!(classify("RIN\u{47e}"), None);
    }
}
