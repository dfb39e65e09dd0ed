//! NMEA GGA sentence encode/decode.
//!
//! Used two ways: the source client formats one every 60 s as a VRS
//! keep-alive/position report (always quality=1, 8 satellites, HDOP 1.0);
//! the caster parses inbound rover sentences to recover the rover's
//! reported position and fix quality for status reporting.

/// GNSS fix-quality label, decoded from the single quality digit in a GGA
/// sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixQuality {
    Single,
    Dgps,
    RtkFixed,
    RtkFloat,
    NotAvailable,
}

impl FixQuality {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Single => "Single",
            Self::Dgps => "DGPS",
            Self::RtkFixed => "RTK Fixed",
            Self::RtkFloat => "RTK Float",
            Self::NotAvailable => "N/A",
        }
    }

    fn from_digit(digit: u8) -> Self {
        match digit {
            1 => Self::Single,
            2 => Self::Dgps,
            4 => Self::RtkFixed,
            5 => Self::RtkFloat,
            _ => Self::NotAvailable,
        }
    }

    fn to_digit(self) -> u8 {
        match self {
            Self::Single => 1,
            Self::Dgps => 2,
            Self::RtkFixed => 4,
            Self::RtkFloat => 5,
            Self::NotAvailable => 0,
        }
    }
}

/// UTC time-of-day, to hundredths of a second, as carried in a GGA
/// sentence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtcTime {
    pub hour: u8,
    pub minute: u8,
    pub second: f64,
}

impl UtcTime {
    /// Derive the UTC time-of-day from seconds since the Unix epoch,
    /// without pulling in a calendar crate — NTRIP keep-alive timing only
    /// needs the wall-clock time-of-day, not the date.
    pub fn from_unix_seconds(unix_seconds: f64) -> Self {
        let secs_of_day = unix_seconds.rem_euclid(86_400.0);
        let hour = (secs_of_day / 3600.0) as u8;
        let minute = ((secs_of_day % 3600.0) / 60.0) as u8;
        let second = secs_of_day % 60.0;
        Self { hour, minute, second }
    }
}

/// A parsed (or to-be-rendered) GGA sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub time: UtcTime,
    pub lat: f64,
    pub lon: f64,
    pub quality: FixQuality,
    pub num_satellites: u8,
    pub hdop: f64,
    pub altitude_m: f64,
}

impl Gga {
    /// Build the fixed-shape keep-alive sentence: quality 1 (Single),
    /// 8 satellites, HDOP 1.0.
    pub fn keepalive(time: UtcTime, lat: f64, lon: f64, altitude_m: f64) -> Self {
        Self {
            time,
            lat,
            lon,
            quality: FixQuality::Single,
            num_satellites: 8,
            hdop: 1.0,
            altitude_m,
        }
    }

    /// Render as `$GPGGA,...*HH\r\n`.
    pub fn to_sentence(&self) -> String {
        let (lat_field, lat_hem) = encode_lat(self.lat);
        let (lon_field, lon_hem) = encode_lon(self.lon);
        let time_field = encode_time(self.time);

        let body = format!(
            "GPGGA,{time},{lat},{lat_hem},{lon},{lon_hem},{q},{sats:02},{hdop:.1},{alt:.1},M,0.0,M,,",
            time = time_field,
            lat = lat_field,
            lon = lon_field,
            q = self.quality.to_digit(),
            sats = self.num_satellites,
            hdop = self.hdop,
            alt = self.altitude_m,
        );

        let checksum = xor_checksum(&body);
        format!("${body}*{checksum:02X}\r\n")
    }

    /// Parse a `$GPGGA,...` or `$GNGGA,...` sentence. Malformed input
    /// yields `None` and is silently dropped by the caster.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let line = line.strip_prefix('$')?;
        let line = line.split('*').next().unwrap_or(line);

        let mut fields = line.split(',');
        let talker = fields.next()?;
        if talker != "GPGGA" && talker != "GNGGA" {
            return None;
        }

        let time_raw = fields.next()?;
        let lat_raw = fields.next()?;
        let lat_hem = fields.next()?;
        let lon_raw = fields.next()?;
        let lon_hem = fields.next()?;
        let quality_raw = fields.next()?;
        let sats_raw = fields.next()?;
        let hdop_raw = fields.next()?;
        let alt_raw = fields.next()?;

        let time = decode_time(time_raw)?;
        let lat = decode_dm(lat_raw, 2)? * hemisphere_sign(lat_hem, 'S')?;
        let lon = decode_dm(lon_raw, 3)? * hemisphere_sign(lon_hem, 'W')?;
        let quality = FixQuality::from_digit(quality_raw.trim().parse().unwrap_or(0));
        let num_satellites = sats_raw.trim().parse().unwrap_or(0);
        let hdop = hdop_raw.trim().parse().unwrap_or(0.0);
        let altitude_m = alt_raw.trim().parse().unwrap_or(0.0);

        Some(Self { time, lat, lon, quality, num_satellites, hdop, altitude_m })
    }
}

fn xor_checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

fn encode_time(t: UtcTime) -> String {
    format!("{:02}{:02}{:05.2}", t.hour, t.minute, t.second)
}

fn decode_time(raw: &str) -> Option<UtcTime> {
    if raw.len() < 6 {
        return None;
    }
    let hour: u8 = raw.get(0..2)?.parse().ok()?;
    let minute: u8 = raw.get(2..4)?.parse().ok()?;
    let second: f64 = raw.get(4..)?.parse().ok()?;
    Some(UtcTime { hour, minute, second })
}

/// Encode a latitude in decimal degrees as `DDMM.mmmmm` plus hemisphere.
/// Uses the sign bit (including signed zero) rather than `< 0.0` so that
/// `-0.0` reliably encodes as the southern hemisphere.
fn encode_lat(lat_deg: f64) -> (String, char) {
    let hem = if lat_deg.is_sign_negative() { 'S' } else { 'N' };
    (encode_dm(lat_deg.abs(), 2), hem)
}

fn encode_lon(lon_deg: f64) -> (String, char) {
    let hem = if lon_deg.is_sign_negative() { 'W' } else { 'E' };
    (encode_dm(lon_deg.abs(), 3), hem)
}

fn encode_dm(abs_deg: f64, deg_width: usize) -> String {
    let deg = abs_deg.trunc() as u32;
    let minutes = (abs_deg - deg as f64) * 60.0;
    format!("{:0width$}{:08.5}", deg, minutes, width = deg_width)
}

fn decode_dm(raw: &str, deg_width: usize) -> Option<f64> {
    if raw.len() < deg_width {
        return None;
    }
    let deg: f64 = raw.get(0..deg_width)?.parse().ok()?;
    let minutes: f64 = raw.get(deg_width..)?.parse().ok()?;
    Some(deg + minutes / 60.0)
}

fn hemisphere_sign(hem: &str, negative: char) -> Option<f64> {
    let c = hem.trim().chars().next()?;
    Some(if c == negative { -1.0 } else { 1.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_latitude_south_encodes_exactly() {
        let (field, hem) = encode_lat(-0.0);
        assert_eq!(field, "0000.00000");
        assert_eq!(hem, 'S');
    }

    #[test]
    fn keepalive_sentence_has_expected_shape() {
        let time = UtcTime { hour: 12, minute: 34, second: 56.78 };
        let gga = Gga::keepalive(time, 21.0285, 105.8542, 100.0);
        let sentence = gga.to_sentence();
        assert!(sentence.starts_with("$GPGGA,123456.78,2101.71000,N,10551.25200,E,1,08,1.0,100.0,M,0.0,M,,*"));
        assert!(sentence.ends_with("\r\n"));
    }

    #[test]
    fn round_trip_preserves_lat_lon_within_tolerance() {
        for (lat, lon) in [
            (21.0285, 105.8542),
            (-33.8688, 151.2093),
            (0.0, 0.0),
            (89.999_99, -179.999_99),
        ] {
            let time = UtcTime { hour: 0, minute: 0, second: 0.0 };
            let gga = Gga::keepalive(time, lat, lon, 50.0);
            let sentence = gga.to_sentence();
            let parsed = Gga::parse(&sentence).expect("round trip parse");
            assert!((parsed.lat - lat).abs() <= 1e-5, "lat drift for {lat}");
            assert!((parsed.lon - lon).abs() <= 1e-5, "lon drift for {lon}");
        }
    }

    #[test]
    fn parses_gngga_and_quality_labels() {
        let sentence = "$GNGGA,143042.00,2101.71000,N,10551.25200,E,4,09,0.9,48.2,M,0.0,M,,*hh\r\n"
            .replace("*hh", "*00");
        let gga = Gga::parse(&sentence).expect("parse");
        assert_eq!(gga.quality.label(), "RTK Fixed");
    }

    #[test]
    fn malformed_sentence_is_dropped() {
        assert!(Gga::parse("$GPRMC,not,a,gga").is_none());
        assert!(Gga::parse("garbage").is_none());
    }
}
