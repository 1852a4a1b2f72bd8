pub mod domain;
pub mod ports;

pub use domain::{
    BonusPayment, CreatedTask, Keywords, MarketplaceCredentials, NewSession, Participant, Profile,
    Session, SessionConfig, SessionData, Site, Submission, SubmissionPage, SubmissionStatus, Task,
    TaskBatchParams, TaskSettings, WorkerReview, WorkerVisit,
};
pub use ports::{
    DatabaseService, HostingService, MarketplaceClient, MarketplaceConnector, PortError,
    PortResult,
};
