// 服务层：分组路径、片段存储、模板与备份

pub mod backup;
pub mod group_path;
pub mod storage;
pub mod templates;
