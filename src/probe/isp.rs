//! Access provider recognition from reverse-DNS names along the path.

use phf::phf_ordered_map;

use super::types::Hop;

/// Hostname fragment to provider name; the first fragment found wins.
const PROVIDER_MARKERS: phf::OrderedMap<&'static str, &'static str> = phf_ordered_map! {
    "comcast" => "Comcast",
    "xfinity" => "Comcast",
    "verizon" => "Verizon",
    "fios" => "Verizon",
    "att.net" => "AT&T",
    "attdns" => "AT&T",
    "cox.net" => "Cox",
    "charter" => "Charter",
    "spectrum" => "Charter",
    "centurylink" => "CenturyLink",
    "qwest" => "CenturyLink",
};

/// Provider named by the first hop whose hostname carries a known marker,
/// walking from the local end of the path.
pub fn detect_isp(hops: &[Hop]) -> Option<String> {
    hops.iter()
        .filter_map(|hop| hop.hostname.as_deref())
        .find_map(|hostname| {
            let hostname = hostname.to_ascii_lowercase();
            PROVIDER_MARKERS
                .entries()
                .find(|(marker, _)| hostname.contains(**marker))
                .map(|(_, provider)| (*provider).to_string())
        })
}
