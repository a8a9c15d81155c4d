pub mod notification_service;
pub mod performance_service;
pub mod reconciliation_service;

pub use notification_service::NotificationService;
pub use performance_service::PerformanceService;
pub use reconciliation_service::ReconciliationService;
