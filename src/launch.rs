use crate::job::AnalysisKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub scan_id: String,
    pub server_url: Option<String>,
    pub image: Option<usize>,
    pub kind: Option<AnalysisKind>,
}

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    if args.len() == 1 && is_casescope_uri(&args[0]) {
        return parse_casescope_uri(&args[0]).map(Some);
    }

    let mut fields = LaunchFields::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) if arg.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let key = match flag {
            "--scan" => "scan",
            "--server" => "server",
            "--image" => "image",
            "--kind" => "kind",
            other if other.starts_with("--") => {
                return Err(format!("Unknown option {other}."));
            }
            // A bare argument is taken as the scan id.
            other => {
                fields.set("scan", other.to_string())?;
                continue;
            }
        };
        let value = match inline_value {
            Some(value) => value,
            None => iter
                .next()
                .cloned()
                .ok_or_else(|| format!("Missing value after {flag}."))?,
        };
        fields.set(key, value)?;
    }
    fields.finish()
}

pub fn parse_casescope_uri(uri: &str) -> Result<LaunchRequest, String> {
    let rest =
        strip_casescope_scheme(uri).ok_or_else(|| "URL must start with casescope://".to_string())?;

    let (location, query) = match rest.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (rest, None),
    };

    let mut fields = LaunchFields::default();
    let location = location.trim().trim_matches('/');
    let lower = location.to_ascii_lowercase();
    if let Some(scan) = lower
        .strip_prefix("open/")
        .map(|_| &location[5..])
        .or_else(|| lower.strip_prefix("scan/").map(|_| &location[5..]))
    {
        fields.set("scan", percent_decode(scan)?)?;
    } else if !location.is_empty() && lower != "open" {
        return Err(format!("Unsupported casescope:// action '{location}'."));
    }

    for pair in query.unwrap_or_default().split('&') {
        let pair = pair.split('#').next().unwrap_or_default();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = key.trim().to_ascii_lowercase();
        let canonical = match key.as_str() {
            "scan" | "scan_id" | "case" => "scan",
            "server" | "server_url" | "api" => "server",
            "image" | "index" => "image",
            "kind" => "kind",
            _ => continue,
        };
        fields.set(canonical, percent_decode(value)?)?;
    }

    fields
        .finish()?
        .ok_or_else(|| "casescope:// URL is missing a scan id.".to_string())
}

#[derive(Default)]
struct LaunchFields {
    scan_id: Option<String>,
    server_url: Option<String>,
    image: Option<usize>,
    kind: Option<AnalysisKind>,
}

impl LaunchFields {
    fn set(&mut self, key: &str, value: String) -> Result<(), String> {
        let value = value.trim();
        match key {
            "scan" => {
                if !value.is_empty() {
                    self.scan_id = Some(value.to_string());
                }
            }
            "server" => {
                if !value.is_empty() {
                    self.server_url = Some(value.to_string());
                }
            }
            "image" => {
                let index = value
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid image index '{value}'."))?;
                self.image = Some(index);
            }
            "kind" => self.kind = Some(value.parse::<AnalysisKind>()?),
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<Option<LaunchRequest>, String> {
        let has_options = self.server_url.is_some() || self.image.is_some() || self.kind.is_some();
        match self.scan_id {
            Some(scan_id) => Ok(Some(LaunchRequest {
                scan_id,
                server_url: self.server_url,
                image: self.image,
                kind: self.kind,
            })),
            None if has_options => Err("Missing scan id (use --scan <id>).".to_string()),
            None => Ok(None),
        }
    }
}

fn is_casescope_uri(value: &str) -> bool {
    strip_casescope_scheme(value).is_some()
}

fn strip_casescope_scheme(uri: &str) -> Option<&str> {
    let prefix = "casescope://";
    let head = uri.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &uri[prefix.len()..])
}

fn percent_decode(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                let escape = bytes
                    .get(index + 1..index + 3)
                    .and_then(|pair| Some((decode_hex_digit(pair[0])? << 4) | decode_hex_digit(pair[1])?))
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                decoded.push(escape);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| "URL contains invalid UTF-8 after decoding.".to_string())
}

fn decode_hex_digit(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parse_open_uri_with_all_fields() {
        let parsed = parse_casescope_uri(
            "casescope://open?scan=case%2017&server=http%3A%2F%2Flocalhost%3A8000%2Fapi&image=2&kind=brain_tumor",
        )
        .expect("uri should parse");
        assert_eq!(
            parsed,
            LaunchRequest {
                scan_id: "case 17".to_string(),
                server_url: Some("http://localhost:8000/api".to_string()),
                image: Some(2),
                kind: Some(AnalysisKind::BrainTumor),
            }
        );
    }

    #[test]
    fn parse_uri_aliases_and_path_form() {
        let parsed = parse_casescope_uri("CaseScope://open/abc-123?API=https://x.org&index=0")
            .expect("uri should parse");
        assert_eq!(parsed.scan_id, "abc-123");
        assert_eq!(parsed.server_url.as_deref(), Some("https://x.org"));
        assert_eq!(parsed.image, Some(0));

        let parsed =
            parse_casescope_uri("casescope://open?case_id=ignored&scan_id=s1").expect("uri");
        assert_eq!(parsed.scan_id, "s1");
    }

    #[test]
    fn parse_uri_errors() {
        assert!(parse_casescope_uri("casescope://open?server=x").is_err());
        assert!(parse_casescope_uri("casescope://open?scan=a&image=two").is_err());
        assert!(parse_casescope_uri("casescope://open?scan=a&kind=xray").is_err());
        assert!(parse_casescope_uri("casescope://open?scan=%2").is_err());
        assert!(parse_casescope_uri("casescope://settings?scan=a").is_err());
        assert!(parse_casescope_uri("perspective://open?scan=a").is_err());
    }

    #[test]
    fn parse_cli_flags() {
        let parsed = parse_launch_request_from_args(&args(&[
            "--scan",
            "s9",
            "--server=http://10.0.0.2/api",
            "--kind",
            "mri-to-ct",
        ]))
        .expect("args should parse");
        assert_eq!(
            parsed,
            Some(LaunchRequest {
                scan_id: "s9".to_string(),
                server_url: Some("http://10.0.0.2/api".to_string()),
                image: None,
                kind: Some(AnalysisKind::MriToCt),
            })
        );
    }

    #[test]
    fn parse_cli_bare_scan_and_uri() {
        assert_eq!(
            parse_launch_request_from_args(&args(&["s3"]))
                .expect("args should parse")
                .map(|request| request.scan_id),
            Some("s3".to_string())
        );
        assert_eq!(
            parse_launch_request_from_args(&args(&["casescope://open?scan=s4"]))
                .expect("args should parse")
                .map(|request| request.scan_id),
            Some("s4".to_string())
        );
        assert_eq!(parse_launch_request_from_args(&[]), Ok(None));
    }

    #[test]
    fn parse_cli_errors() {
        assert!(parse_launch_request_from_args(&args(&["--scan"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--image", "1"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--verbose"])).is_err());
    }
}
