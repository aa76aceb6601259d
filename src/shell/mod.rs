//! The new-tab shell: routing, remote frames and the asset cache behind them.

pub mod cache;
pub mod frame;
pub mod router;
pub mod warming;

pub use cache::{Asset, AssetCache, AssetFetcher, CachePolicy, HttpFetcher};
pub use frame::{Frame, FrameLauncher, FrameSpec, Visibility};
pub use router::{
    AssumeOnline, Connectivity, FastPathReason, RemoteSession, RouterSettings, ShellOutcome,
    ShellRouter, StaticConnectivity,
};
pub use warming::HttpWarmingLauncher;
