// 数据模型模块

pub mod backup;
pub mod connection;
pub mod group;
pub mod settings;
pub mod template;

pub use backup::{BackupManifest, BackupSummary, ManifestConnection};
pub use connection::{
    AdvancedSettings, Connection, ConnectionListing, ConnectionOptions, ConnectionUpdate,
    ListingProblem, PortForward, RemoteForward, SavedConnection,
};
pub use group::{GroupInfo, GroupNode};
pub use settings::ManagerSettings;
pub use template::{RenderResult, TemplateInfo, ValidationReport};
