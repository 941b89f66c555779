//! 模块暂存
//!
//! 加载前先把源模块复制到一个唯一命名的临时文件：同一个源文件可以被多个实例并发加载，
//! 也避开了源文件上的文件锁。返回的 [`TempPath`] 在 drop/close 时删除文件。

use crate::CanError;
use std::env::consts::DLL_SUFFIX;
use std::fs::File;
use std::io;
use std::path::Path;
use tempfile::TempPath;

pub(crate) fn stage_module(
    source: &Path,
    staging_dir: &Path,
    prefix: &str,
) -> Result<TempPath, CanError> {
    let mut src = File::open(source).map_err(|e| CanError::Staging {
        path: source.to_path_buf(),
        source: e,
    })?;

    let mut dst = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(DLL_SUFFIX)
        .tempfile_in(staging_dir)
        .map_err(|e| CanError::Staging {
            path: staging_dir.to_path_buf(),
            source: e,
        })?;

    let copy_result = io::copy(&mut src, dst.as_file_mut()).and_then(|_| dst.as_file().sync_all());
    if let Err(e) = copy_result {
        // dst 在此处 drop，临时文件随之删除
        return Err(CanError::Staging {
            path: dst.path().to_path_buf(),
            source: e,
        });
    }

    // 关闭写句柄后再交给系统加载器，只保留路径（drop 时删除）
    Ok(dst.into_temp_path())
}
