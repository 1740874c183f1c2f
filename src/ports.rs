//! The static port universe and its inversion against a subscriber's selection.

use std::collections::BTreeSet;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CatalogueRow {
    tcp_rules: String,
    udp_rules: String,
}

/// The full universe of TCP and UDP port tokens, loaded once at startup and
/// never mutated again — built once in `main` and shared by `Arc` thereafter.
#[derive(Debug, Clone)]
pub struct PortMatrix {
    tcp: Vec<String>,
    udp: Vec<String>,
}

impl PortMatrix {
    pub fn load(path: &std::path::Path) -> Result<PortMatrix, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        let rows: Vec<CatalogueRow> = serde_json::from_str(&contents)?;
        Ok(PortMatrix::from_rows(&rows))
    }

    fn from_rows(rows: &[CatalogueRow]) -> PortMatrix {
        let mut tcp = BTreeSet::new();
        let mut udp = BTreeSet::new();
        for row in rows {
            tcp.extend(tokenize(&row.tcp_rules));
            udp.extend(tokenize(&row.udp_rules));
        }
        PortMatrix {
            tcp: tcp.into_iter().collect(),
            udp: udp.into_iter().collect(),
        }
    }

    /// Returns `(inv_tcp, inv_udp)`: the comma-joined, universe-ordered
    /// complement of the subscriber's selected tokens. Tokens are compared
    /// as opaque, trimmed strings — ranges are never expanded.
    pub fn invert(&self, selected_tcp: &str, selected_udp: &str) -> (String, String) {
        (
            invert_against(&self.tcp, selected_tcp),
            invert_against(&self.udp, selected_udp),
        )
    }
}

fn tokenize(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_owned())
}

fn invert_against(universe: &[String], selected: &str) -> String {
    let selected: BTreeSet<&str> = selected.split(',').map(|t| t.trim()).collect();
    universe
        .iter()
        .filter(|token| !selected.contains(token.as_str()))
        .cloned()
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> PortMatrix {
        PortMatrix::from_rows(&[CatalogueRow {
            tcp_rules: "22,80,443".to_owned(),
            udp_rules: "53".to_owned(),
        }])
    }

    // "22" < "443" < "80" under plain string ordering; the universe is sorted
    // lexicographically as strings, not numerically.
    #[test]
    fn empty_selection_yields_full_universe_in_lexicographic_order() {
        let m = matrix();
        let (tcp, udp) = m.invert("", "");
        assert_eq!(tcp, "22,443,80");
        assert_eq!(udp, "53");
    }

    #[test]
    fn full_selection_yields_empty_inverse() {
        let m = matrix();
        let (tcp, udp) = m.invert("22,443,80", "53");
        assert_eq!(tcp, "");
        assert_eq!(udp, "");
    }

    #[test]
    fn selection_and_inverse_partition_the_universe() {
        let m = matrix();
        let (inv_tcp, _) = m.invert("80", "");
        let selected: BTreeSet<&str> = "80".split(',').collect();
        let inverted: BTreeSet<&str> = inv_tcp.split(',').collect();
        assert!(selected.is_disjoint(&inverted));
        let union: BTreeSet<&str> = selected.union(&inverted).cloned().collect();
        let universe: BTreeSet<&str> = m.tcp.iter().map(|s| s.as_str()).collect();
        assert_eq!(union, universe);
    }

    #[test]
    fn inversion_is_its_own_involution_restricted_to_the_universe() {
        let m = matrix();
        let (inv_tcp, inv_udp) = m.invert("80", "");
        let (inv_inv_tcp, inv_inv_udp) = m.invert(&inv_tcp, &inv_udp);
        assert_eq!(inv_inv_tcp, "80");
        assert_eq!(inv_inv_udp, "53");
    }

    #[test]
    fn empty_universe_inverse_is_always_empty() {
        let m = PortMatrix::from_rows(&[]);
        let (tcp, udp) = m.invert("80", "53");
        assert_eq!(tcp, "");
        assert_eq!(udp, "");
    }

    #[test]
    fn tokens_compared_as_opaque_strings_not_expanded_ranges() {
        let m = PortMatrix::from_rows(&[CatalogueRow {
            tcp_rules: "1024-65535,80".to_owned(),
            udp_rules: "".to_owned(),
        }]);
        let (tcp, _) = m.invert("80", "");
        assert_eq!(tcp, "1024-65535");
    }
}
