//! SQL builders. DDL renders inline; data statements return placeholders
//! plus bound values for `db::bind_query`.

pub mod ddl;
pub mod messages;
pub mod metadata;
pub mod sessions;
pub mod videos;
