//! NTRIP sourcetable rendering and parsing.
//!
//! Rendering is used by the caster side (`GET /` response body);
//! parsing is the inverse, used when probing a remote caster
//! (`RelaySupervisor::probe_source`).

use crate::ProtoError;

/// One `STR;` record: the metadata for a single mountpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MountpointInfo {
    pub name: String,
    pub identifier: String,
    pub format: String,
    pub format_details: String,
    pub carrier: String,
    pub nav_system: String,
    pub network: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub nmea_required: bool,
    pub solution: String,
    pub generator: String,
    pub compression: String,
    pub bitrate: String,
}

impl MountpointInfo {
    /// Defaults shared by every mountpoint; only `name`, `country`,
    /// `lat`, `lon`, `network` vary per station.
    pub fn new(name: impl Into<String>, network: impl Into<String>, country: impl Into<String>, lat: f64, lon: f64) -> Self {
        let name = name.into();
        Self {
            identifier: name.clone(),
            name,
            format: "RTCM 3.2".to_string(),
            format_details: "1004(1),1005/1006(5),1019(5),1020(5)".to_string(),
            carrier: "2".to_string(),
            nav_system: "GPS+GLO+GAL+BDS".to_string(),
            network: network.into(),
            country: country.into(),
            lat,
            lon,
            nmea_required: true,
            solution: "1".to_string(),
            generator: "NTRIP-Relay/1.0".to_string(),
            compression: "none".to_string(),
            bitrate: "2400".to_string(),
        }
    }

    fn render(&self) -> String {
        format!(
            "STR;{name};{identifier};{format};{details};{carrier};{nav};{network};{country};{lat:.4};{lon:.4};{nmea};{solution};{generator};{compression};B;N;{bitrate}",
            name = self.name,
            identifier = self.identifier,
            format = self.format,
            details = self.format_details,
            carrier = self.carrier,
            nav = self.nav_system,
            network = self.network,
            country = self.country,
            lat = self.lat,
            lon = self.lon,
            nmea = if self.nmea_required { "1" } else { "0" },
            solution = self.solution,
            generator = self.generator,
            compression = self.compression,
            bitrate = self.bitrate,
        )
    }

    /// Parse a `STR;...` line. Tolerates trailing fields beyond the ones
    /// this struct keeps (a remote caster's sourcetable may carry extras).
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("STR;")?;
        let f: Vec<&str> = rest.split(';').collect();
        if f.len() < 17 {
            return None;
        }

        Some(Self {
            name: f[0].to_string(),
            identifier: f[1].to_string(),
            format: f[2].to_string(),
            format_details: f[3].to_string(),
            carrier: f[4].to_string(),
            nav_system: f[5].to_string(),
            network: f[6].to_string(),
            country: f[7].to_string(),
            lat: f[8].parse().ok()?,
            lon: f[9].parse().ok()?,
            nmea_required: f[10].trim() == "1",
            solution: f[11].to_string(),
            generator: f[12].to_string(),
            compression: f[13].to_string(),
            bitrate: f[16].to_string(),
        })
    }
}

/// Caster-identifying fields for the `CAS;` line.
#[derive(Debug, Clone)]
pub struct CasterInfo {
    pub host: String,
    pub port: u16,
    pub identifier: String,
    pub operator: String,
    pub country: String,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    pub network: String,
}

impl CasterInfo {
    fn render_cas(&self) -> String {
        format!(
            "CAS;{host};{port};{identifier};{operator};{country};{lat:.4};{lon:.4}",
            host = self.host,
            port = self.port,
            identifier = self.identifier,
            operator = self.operator,
            country = self.country,
            lat = self.centroid_lat,
            lon = self.centroid_lon,
        )
    }

    fn render_net(&self) -> String {
        format!("NET;{network};{operator};N;N;none;none;none;none", network = self.network, operator = self.operator)
    }
}

/// Render the sourcetable body (everything after the blank line that ends
/// the response headers): `STR` lines, one `CAS` line, one `NET` line,
/// `ENDSOURCETABLE`.
pub fn render_body(mountpoints: &[MountpointInfo], caster: &CasterInfo) -> String {
    let mut body = String::new();
    for mp in mountpoints {
        body.push_str(&mp.render());
        body.push_str("\r\n");
    }
    body.push_str(&caster.render_cas());
    body.push_str("\r\n");
    body.push_str(&caster.render_net());
    body.push_str("\r\n");
    body.push_str("ENDSOURCETABLE\r\n");
    body
}

/// Render the complete `SOURCETABLE 200 OK` response (headers + body).
pub fn render_response(mountpoints: &[MountpointInfo], caster: &CasterInfo) -> Vec<u8> {
    let body = render_body(mountpoints, caster);
    let head = format!(
        "SOURCETABLE 200 OK\r\nServer: NTRIP-Relay/1.0\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

/// Parse a `SOURCETABLE 200 OK` response body (or full response — the
/// status line, if present, is validated but otherwise ignored) into its
/// `STR;` records.
pub fn parse_sourcetable(bytes: &[u8]) -> Result<Vec<MountpointInfo>, ProtoError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtoError::Utf8)?;

    let mut lines = text.split("\r\n").peekable();
    if let Some(first) = lines.peek() {
        if first.starts_with("SOURCETABLE") && !first.contains("200 OK") {
            return Err(ProtoError::MalformedStatusLine((*first).to_string()));
        }
    }

    Ok(lines.filter_map(MountpointInfo::parse).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caster() -> CasterInfo {
        CasterInfo {
            host: "127.0.0.1".to_string(),
            port: 9001,
            identifier: "NTRIP-Relay".to_string(),
            operator: "NTRIP Relay Service".to_string(),
            country: "VNM".to_string(),
            centroid_lat: 21.0,
            centroid_lon: 105.0,
            network: "CORS".to_string(),
        }
    }

    #[test]
    fn empty_sourcetable_has_no_str_lines() {
        let body = render_body(&[], &caster());
        assert!(body.ends_with("ENDSOURCETABLE\r\n"));
        assert!(!body.contains("STR;"));
        assert!(body.contains("CAS;127.0.0.1;9001;"));
        assert!(body.contains("NET;CORS;"));
    }

    #[test]
    fn sourcetable_round_trips_through_probe_parser() {
        let mountpoints = vec![
            MountpointInfo::new("VRS01", "CORS", "VNM", 21.0285, 105.8542),
            MountpointInfo::new("VRS02", "CORS", "VNM", -33.8688, 151.2093),
        ];

        let response = render_response(&mountpoints, &caster());
        let parsed = parse_sourcetable(&response).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "VRS01");
        assert!((parsed[0].lat - 21.0285).abs() < 1e-4);
        assert!((parsed[0].lon - 105.8542).abs() < 1e-4);
        assert_eq!(parsed[1].name, "VRS02");
    }

    #[test]
    fn parser_tolerates_unknown_extra_fields() {
        let line = "STR;X;X;RTCM 3.2;details;2;GPS;CORS;VNM;21.0000;105.0000;1;1;gen;none;B;N;2400;EXTRA;EXTRA2";
        let mp = MountpointInfo::parse(line).expect("parses despite extras");
        assert_eq!(mp.name, "X");
    }
}
