/*
    permissions - Who may write what

    Authorization is data: roles and read keys live in each group's own
    register map and are re-derived from the log on every read.
    - role        roles and role-table keys
    - evaluator   valid-transaction filtering for every ruleset
    - group       membership, read keys and owned-value creation
    - invite      shareable invite links
*/

pub mod evaluator;
pub mod group;
pub mod invite;
pub mod role;

pub use evaluator::{determine_valid_transactions, ValidTransaction, ValueResolver};
pub use group::Group;
pub use invite::{InviteError, InviteLink};
pub use role::{MemberKey, Role};
