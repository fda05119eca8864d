//! DfuSe transfer options
//!
//! Options come as a single string of the form
//! `[address][:modifier[:modifier...]]`, for example `0x08000000:leave`
//! or `:mass-erase:force`. The address must come first. Unknown tokens are
//! ignored rather than rejected, so a typo degrades to "option not set".

/// Transfer configuration built from a DfuSe option string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferConfig {
    /// Target address for the download
    pub address: Option<u32>,
    /// Upload length (unused by download)
    pub length: Option<u32>,
    /// Number of times `force` was given
    pub force: u32,
    /// Jump to the new firmware after the download
    pub leave: bool,
    /// Remove read protection (erases the device)
    pub unprotect: bool,
    /// Erase the whole device before the download
    pub mass_erase: bool,
    /// The device resets by itself after the last chunk
    pub will_reset: bool,
}

impl TransferConfig {
    /// Whether `force` was given at least once
    pub fn forced(&self) -> bool {
        self.force > 0
    }
}

/// Parse a DfuSe option string
pub fn parse_options(options: &str) -> TransferConfig {
    let mut config = TransferConfig::default();
    let mut tokens = options.split(':');

    // The first token is the address slot, possibly empty
    if let Some(first) = tokens.next() {
        if !first.is_empty() {
            match parse_number(first) {
                Some(address) => config.address = Some(address),
                None => log::warn!("Ignoring invalid DfuSe address: {}", first),
            }
        }
    }

    for token in tokens {
        match token {
            "" => {}
            "force" => config.force += 1,
            "leave" => config.leave = true,
            "unprotect" => config.unprotect = true,
            "mass-erase" => config.mass_erase = true,
            "will-reset" => config.will_reset = true,
            other => match parse_number(other) {
                Some(length) => config.length = Some(length),
                None => log::warn!("Ignoring invalid DfuSe modifier: {}", other),
            },
        }
    }

    log::debug!("DfuSe options {:?} -> {:?}", options, config);
    config
}

/// Parse an unsigned integer, detecting the base from its prefix
///
/// `0x`/`0X` selects hexadecimal, a leading `0` octal, anything else
/// decimal. The whole token must be consumed.
pub fn parse_number(s: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    // from_str_radix accepts a leading '+', a bare number does not here
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}
