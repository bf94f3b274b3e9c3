use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One backend address and its last probe result.
#[derive(Debug)]
pub struct Upstream {
    pub addr: String,
    healthy: AtomicBool,
}

impl Upstream {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Record a probe result; returns whether the state changed.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed) != healthy
    }
}

/// Backends picked round-robin among the healthy ones.
#[derive(Debug)]
pub struct Upstreams {
    list: Vec<Upstream>,
    next: AtomicUsize,
}

impl Upstreams {
    /// Every upstream starts healthy so connections flow before the first probe.
    pub fn new(addrs: &[String]) -> Self {
        Self {
            list: addrs
                .iter()
                .map(|a| Upstream {
                    addr: a.clone(),
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Next healthy upstream after the previous pick, `None` when all are down.
    pub fn pick(&self) -> Option<&Upstream> {
        let n = self.list.len();
        if n == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &self.list[(start + i) % n])
            .find(|u| u.is_healthy())
    }
}

/// Parse a comma separated `host:port` list.
pub fn parse_upstreams(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<String> {
        parse_upstreams("a:6443, b:6443,,c:6443")
    }

    #[test]
    fn test_parse_skips_empty() {
        assert_eq!(addrs(), vec!["a:6443", "b:6443", "c:6443"]);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let ups = Upstreams::new(&addrs());
        let picks: Vec<&str> = (0..3).map(|_| ups.pick().unwrap().addr.as_str()).collect();
        assert_eq!(picks, vec!["a:6443", "b:6443", "c:6443"]);

        assert!(ups.list[1].set_healthy(false));
        assert!(!ups.list[1].set_healthy(false));
        let picks: Vec<&str> = (0..4).map(|_| ups.pick().unwrap().addr.as_str()).collect();
        assert!(!picks.contains(&"b:6443"));
    }

    #[test]
    fn test_all_down() {
        let ups = Upstreams::new(&addrs());
        for u in ups.iter() {
            u.set_healthy(false);
        }
        assert!(ups.pick().is_none());
        assert!(Upstreams::new(&[]).pick().is_none());
    }
}
