//! Protocol revision gates.
//!
//! Every optional wire field is guarded by a `Feature`; the negotiated revision
//! is passed explicitly to whoever encodes or decodes a gated structure.

/// Revision this client speaks by default.
pub const CLIENT_REVISION: u64 = 54460;

/// Optional protocol features, each introduced at a fixed server revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    TempTables,
    BlockInfo,
    ClientInfo,
    ServerTimezone,
    QuotaKeyInClientInfo,
    DisplayName,
    VersionPatch,
    ServerLogs,
    ClientWriteInfo,
    SettingsAsStrings,
    InterServerSecret,
    OpenTelemetry,
    DistributedDepth,
    QueryStartTime,
    ProfileEvents,
    ParallelReplicas,
    CustomSerialization,
    Addendum,
    Parameters,
    ServerQueryTimeInProgress,
}

impl Feature {
    pub const ALL: [Feature; 20] = [
        Feature::TempTables,
        Feature::BlockInfo,
        Feature::ClientInfo,
        Feature::ServerTimezone,
        Feature::QuotaKeyInClientInfo,
        Feature::DisplayName,
        Feature::VersionPatch,
        Feature::ServerLogs,
        Feature::ClientWriteInfo,
        Feature::SettingsAsStrings,
        Feature::InterServerSecret,
        Feature::OpenTelemetry,
        Feature::DistributedDepth,
        Feature::QueryStartTime,
        Feature::ProfileEvents,
        Feature::ParallelReplicas,
        Feature::CustomSerialization,
        Feature::Addendum,
        Feature::Parameters,
        Feature::ServerQueryTimeInProgress,
    ];

    /// First revision that carries this feature.
    pub const fn revision(self) -> u64 {
        match self {
            Feature::TempTables => 50264,
            Feature::BlockInfo => 51903,
            Feature::ClientInfo => 54032,
            Feature::ServerTimezone => 54058,
            Feature::QuotaKeyInClientInfo => 54060,
            Feature::DisplayName => 54372,
            Feature::VersionPatch => 54401,
            Feature::ServerLogs => 54406,
            Feature::ClientWriteInfo => 54420,
            Feature::SettingsAsStrings => 54429,
            Feature::InterServerSecret => 54441,
            Feature::OpenTelemetry => 54442,
            Feature::DistributedDepth => 54448,
            Feature::QueryStartTime => 54449,
            Feature::ProfileEvents => 54451,
            Feature::ParallelReplicas => 54453,
            Feature::CustomSerialization => 54454,
            Feature::Addendum => 54458,
            Feature::Parameters => 54459,
            Feature::ServerQueryTimeInProgress => 54460,
        }
    }

    /// Whether `revision` includes this feature.
    #[inline]
    pub const fn supported(self, revision: u64) -> bool {
        revision >= self.revision()
    }
}

/// The revision both sides speak after the handshake.
pub fn negotiate(client: u64, server: u64) -> u64 {
    client.min(server)
}
