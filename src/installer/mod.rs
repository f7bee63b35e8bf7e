// 模型安装模块

pub mod error;
pub mod event;
pub mod model_id;
pub mod notification;
pub mod registry;
pub mod session;
pub mod transport;
pub mod verification;
pub mod worker;

pub use error::{CliError, InstallError, SessionError};
pub use event::{ProgressEvent, PullStatus, StreamEventParser, DEFAULT_MANIFEST_SLOW_THRESHOLD};
pub use model_id::ModelId;
pub use notification::{NotificationReceiver, Notifier, SessionNotification};
pub use registry::SessionRegistry;
pub use session::{DownloadSession, SessionState, Transition, TransportKind};
pub use transport::{CliInstaller, FallbackInstaller, LineStream, PullSource, TransportStrategy};
pub use verification::{VerificationOutcome, VerificationProbe};
pub use worker::{SessionWorker, FALLBACK_REASON, STREAM_ENDED_EARLY};
