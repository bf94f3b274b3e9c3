use std::fmt;

/// Container images run by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Image {
    Etcd,
    Kubernetes,
    Tools,
    Pause,
    CoreDns,
    Unbound,
    EtcdBackup,
}

impl Image {
    pub const ALL: &'static [Image] = &[
        Self::Etcd,
        Self::Kubernetes,
        Self::Tools,
        Self::Pause,
        Self::CoreDns,
        Self::Unbound,
        Self::EtcdBackup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Etcd => "ghcr.io/cybozu/etcd:3.5.17.1",
            Self::Kubernetes => "ghcr.io/cybozu/kubernetes:1.32.1.1",
            Self::Tools => "ghcr.io/cybozu-go/cke-tools:1.32.0",
            Self::Pause => "ghcr.io/cybozu/pause:3.10.0.1",
            Self::CoreDns => "ghcr.io/cybozu/coredns:1.12.0.1",
            Self::Unbound => "ghcr.io/cybozu/unbound:1.22.0.1",
            Self::EtcdBackup => "ghcr.io/cybozu/etcd:3.5.17.1",
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Distinct image names, in a stable order, for `ckecli images`.
pub fn all_images() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Image::ALL.iter().map(|i| i.name()).collect();
    names.sort_unstable();
    names.dedup();
    names
}
