pub mod applicant2;
pub mod conditional_order;
pub mod final_order;
pub mod holding;
pub mod payment;
pub mod service;

use crate::rules::TaskRegistry;

/// Register all built-in tasks into the registry.
pub fn register_all(registry: &mut TaskRegistry) {
    registry.register(holding::progress_held_cases());
    registry.register(service::progress_to_aos_overdue());
    registry.register(applicant2::remind_applicant2());
    registry.register(applicant2::applicant2_not_reviewed());
    registry.register(conditional_order::remind_applicants_conditional_order());
    registry.register(final_order::progress_to_awaiting_final_order());
    registry.register(final_order::remind_applicants_final_order());
    registry.register(final_order::remind_awaiting_joint_final_order());
    registry.register(final_order::notify_respondent_apply_final_order());
    registry.register(payment::progress_paid_cases());
}
