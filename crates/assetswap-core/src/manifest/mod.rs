//! Manifest crafting - ダウンロード用マニフェスト 2 種の作業コピーを作る
//!
//! # 対象
//! - asset-info (`BLDatabaseManager.sqlite`, table `ZBLDOWNLOADINFO`)
//!   どこへ置くか・どこから取るかを持つ
//! - download-list (`downloads.28.sqlitedb`, table `asset`)
//!   asset-info 自体をどこから取り直すかを持つ
//!
//! テンプレートが無ければプレースホルダ 1 行だけのものを作る。
//! 書き換えは必ずバインド変数で行い、末尾一致は SQL 側で厳密に比較する。

use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::domain::{ContainerId, ManifestError};
use crate::server::ServedBinding;

/// Auxiliary files SQLite keeps next to a database.
pub const AUX_SUFFIXES: [&str; 2] = ["-shm", "-wal"];

const ASSET_INFO_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS ZBLDOWNLOADINFO \
     (ZASSETPATH VARCHAR, ZPLISTPATH VARCHAR, ZDOWNLOADID VARCHAR, ZURL VARCHAR)";
const ASSET_INFO_PLACEHOLDER: &str = "INSERT INTO ZBLDOWNLOADINFO VALUES ('', '', '', '')";

const DOWNLOAD_LIST_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS asset (local_path VARCHAR, url VARCHAR)";
const DOWNLOAD_LIST_PLACEHOLDER: &str = "INSERT INTO asset VALUES (\
     '/private/var/containers/Shared/SystemGroup/UUID/Documents/BLDatabaseManager/BLDatabaseManager.sqlite', \
     'http://url')";

/// File names used by the crafter, all relative to `workdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLayout {
    pub workdir: PathBuf,
    pub asset_info_template: String,
    pub download_list_template: String,
    pub asset_info_working: String,
    pub download_list_working: String,
    /// Name of the genuine asset-info database on the device.
    pub genuine_name: String,
}

impl ManifestLayout {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            asset_info_template: "BLDatabaseManager.sqlite".to_string(),
            download_list_template: "downloads.28.sqlitedb".to_string(),
            asset_info_working: "working_BL.sqlite".to_string(),
            download_list_working: "working_DL.sqlitedb".to_string(),
            genuine_name: "BLDatabaseManager.sqlite".to_string(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }

    pub fn asset_info_working_path(&self) -> PathBuf {
        self.path(&self.asset_info_working)
    }

    pub fn download_list_working_path(&self) -> PathBuf {
        self.path(&self.download_list_working)
    }

    pub fn download_list_aux_paths(&self) -> [PathBuf; 2] {
        AUX_SUFFIXES.map(|suffix| self.path(&format!("{}{suffix}", self.download_list_working)))
    }

    /// The task-scoped files crafting may leave behind.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        let mut files = vec![
            self.asset_info_working_path(),
            self.download_list_working_path(),
        ];
        files.extend(self.download_list_aux_paths());
        files
    }

    /// Names the asset server may hand out besides the target asset.
    pub fn servable_names(&self) -> Vec<String> {
        let mut names = vec![self.asset_info_working.clone()];
        names.extend(
            AUX_SUFFIXES
                .iter()
                .map(|suffix| format!("{}{suffix}", self.asset_info_working)),
        );
        names
    }

    /// Every file name the crafter owns inside `workdir`.
    pub fn reserved_names(&self) -> Vec<String> {
        let mut names = vec![
            self.asset_info_template.clone(),
            self.download_list_template.clone(),
            self.download_list_working.clone(),
        ];
        names.extend(
            AUX_SUFFIXES
                .iter()
                .map(|suffix| format!("{}{suffix}", self.download_list_working)),
        );
        names.extend(self.servable_names());
        names
    }

    /// Where the genuine asset-info database lives inside the container.
    pub fn device_manifest_path(&self, container: &ContainerId) -> String {
        format!(
            "/private/var/containers/Shared/SystemGroup/{container}/Documents/BLDatabaseManager/{}",
            self.genuine_name
        )
    }
}

/// Where the crafted manifests should send the device.
#[derive(Debug, Clone)]
pub struct Redirect<'a> {
    /// Device path the replacement asset is installed to.
    pub target_path: &'a str,
    /// File name the asset is served under.
    pub asset_name: &'a str,
    pub container: &'a ContainerId,
    pub binding: ServedBinding,
}

/// Files ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CraftedManifests {
    pub asset_info: PathBuf,
    pub download_list: PathBuf,
    pub download_list_aux: [PathBuf; 2],
}

pub struct ManifestCrafter {
    layout: ManifestLayout,
}

fn sqlite_err(path: &Path) -> impl Fn(rusqlite::Error) -> ManifestError + '_ {
    move |source| ManifestError::Sqlite {
        path: path.to_path_buf(),
        source,
    }
}

fn create_template(path: &Path, schema: &str, placeholder: &str) -> Result<(), ManifestError> {
    let conn = Connection::open(path).map_err(sqlite_err(path))?;
    conn.execute_batch(&format!("{schema};\n{placeholder};"))
        .map_err(sqlite_err(path))?;
    Ok(())
}

fn copy(from: &Path, to: &Path) -> Result<(), ManifestError> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| ManifestError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

impl ManifestCrafter {
    pub fn new(layout: ManifestLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ManifestLayout {
        &self.layout
    }

    /// Create missing templates with a single placeholder row each.
    pub fn ensure_templates(&self) -> Result<(), ManifestError> {
        let asset_info = self.layout.path(&self.layout.asset_info_template);
        if !asset_info.exists() {
            info!(path = %asset_info.display(), "creating asset-info template");
            create_template(&asset_info, ASSET_INFO_SCHEMA, ASSET_INFO_PLACEHOLDER)?;
        }

        let download_list = self.layout.path(&self.layout.download_list_template);
        if !download_list.exists() {
            info!(path = %download_list.display(), "creating download-list template");
            create_template(&download_list, DOWNLOAD_LIST_SCHEMA, DOWNLOAD_LIST_PLACEHOLDER)?;
        }
        Ok(())
    }

    pub fn craft(&self, redirect: &Redirect<'_>) -> Result<CraftedManifests, ManifestError> {
        self.ensure_templates()?;

        let asset_info = self.layout.asset_info_working_path();
        let download_list = self.layout.download_list_working_path();
        let download_list_aux = self.layout.download_list_aux_paths();

        // 前回の残骸の -wal を新しいコピーに適用させない
        for stale in self.layout.scratch_files() {
            let _ = std::fs::remove_file(stale);
        }
        copy(&self.layout.path(&self.layout.asset_info_template), &asset_info)?;
        copy(&self.layout.path(&self.layout.download_list_template), &download_list)?;

        self.rewrite_asset_info(&asset_info, redirect)?;
        self.rewrite_download_list(&download_list, redirect)?;

        Ok(CraftedManifests {
            asset_info,
            download_list,
            download_list_aux,
        })
    }

    fn rewrite_asset_info(&self, path: &Path, redirect: &Redirect<'_>) -> Result<(), ManifestError> {
        let asset_url = redirect.binding.url_for(redirect.asset_name);
        let mut conn = Connection::open(path).map_err(sqlite_err(path))?;
        let tx = conn.transaction().map_err(sqlite_err(path))?;
        let rows = tx
            .execute(
                "UPDATE ZBLDOWNLOADINFO SET ZASSETPATH = ?1, ZPLISTPATH = ?1, ZDOWNLOADID = ?1, ZURL = ?2",
                params![redirect.target_path, asset_url],
            )
            .map_err(sqlite_err(path))?;
        tx.commit().map_err(sqlite_err(path))?;
        debug!(rows, url = %asset_url, "asset-info rewritten");
        Ok(())
    }

    fn rewrite_download_list(
        &self,
        path: &Path,
        redirect: &Redirect<'_>,
    ) -> Result<(), ManifestError> {
        let device_path = self.layout.device_manifest_path(redirect.container);
        let manifest_url = redirect.binding.url_for(&self.layout.asset_info_working);

        let mut conn = Connection::open(path).map_err(sqlite_err(path))?;
        let tx = conn.transaction().map_err(sqlite_err(path))?;
        let mut rows = 0;
        for suffix in ["", AUX_SUFFIXES[0], AUX_SUFFIXES[1]] {
            let genuine = format!("/{}{suffix}", self.layout.genuine_name);
            rows += tx
                .execute(
                    "UPDATE asset SET local_path = ?1 WHERE substr(local_path, -length(?2)) = ?2",
                    params![format!("{device_path}{suffix}"), genuine],
                )
                .map_err(sqlite_err(path))?;
            rows += tx
                .execute(
                    "UPDATE asset SET url = ?1 WHERE substr(url, -length(?2)) = ?2",
                    params![format!("{manifest_url}{suffix}"), genuine],
                )
                .map_err(sqlite_err(path))?;
        }
        tx.commit().map_err(sqlite_err(path))?;
        debug!(rows, device_path, url = %manifest_url, "download-list rewritten");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const ID: &str = "0A1B2C3D-4E5F-6789-ABCD-EF0123456789";

    fn binding() -> ServedBinding {
        ServedBinding {
            host: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 8123,
        }
    }

    fn rows(path: &Path, sql: &str) -> Vec<Vec<String>> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let width = stmt.column_count();
        stmt.query_map([], |row| {
            (0..width)
                .map(|i| row.get::<_, Option<String>>(i).map(Option::unwrap_or_default))
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    fn columns(path: &Path, table: &str) -> Vec<String> {
        rows(path, &format!("SELECT name FROM pragma_table_info('{table}')"))
            .into_iter()
            .map(|mut r| r.remove(0))
            .collect()
    }

    #[test]
    fn absent_templates_get_one_placeholder_row() {
        let dir = tempfile::tempdir().unwrap();
        let crafter = ManifestCrafter::new(ManifestLayout::new(dir.path()));
        crafter.ensure_templates().unwrap();

        let asset_info = dir.path().join("BLDatabaseManager.sqlite");
        assert_eq!(
            columns(&asset_info, "ZBLDOWNLOADINFO"),
            ["ZASSETPATH", "ZPLISTPATH", "ZDOWNLOADID", "ZURL"]
        );
        assert_eq!(rows(&asset_info, "SELECT * FROM ZBLDOWNLOADINFO"), [["", "", "", ""]]);

        let download_list = dir.path().join("downloads.28.sqlitedb");
        assert_eq!(columns(&download_list, "asset"), ["local_path", "url"]);
        let placeholder = rows(&download_list, "SELECT * FROM asset");
        assert_eq!(placeholder.len(), 1);
        assert!(placeholder[0][0].ends_with("/BLDatabaseManager.sqlite"));

        // 2 回目は何も増やさない
        crafter.ensure_templates().unwrap();
        assert_eq!(rows(&download_list, "SELECT * FROM asset").len(), 1);
    }

    #[test]
    fn asset_info_points_every_row_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("BLDatabaseManager.sqlite");
        create_template(&template, ASSET_INFO_SCHEMA, ASSET_INFO_PLACEHOLDER).unwrap();
        Connection::open(&template)
            .unwrap()
            .execute(
                "INSERT INTO ZBLDOWNLOADINFO VALUES ('/a', '/b', 'id-2', 'http://apple/x')",
                [],
            )
            .unwrap();

        let crafter = ManifestCrafter::new(ManifestLayout::new(dir.path()));
        let container = ContainerId::parse(ID).unwrap();
        let target = "/var/mobile/Library/CallServices/Greetings/default/StopDisclosure.caf";
        let crafted = crafter
            .craft(&Redirect {
                target_path: target,
                asset_name: "StopDisclosure.caf",
                container: &container,
                binding: binding(),
            })
            .unwrap();

        let all = rows(&crafted.asset_info, "SELECT * FROM ZBLDOWNLOADINFO");
        assert_eq!(all.len(), 2);
        for row in all {
            assert_eq!(&row[0..3], &[target, target, target]);
            assert_eq!(row[3], "http://192.168.1.20:8123/StopDisclosure.caf");
        }
        // テンプレート自体は書き換えない
        assert_eq!(
            rows(&template, "SELECT ZASSETPATH FROM ZBLDOWNLOADINFO")[1],
            ["/a"]
        );
    }

    #[test]
    fn download_list_rewrites_exact_suffixes_only() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("downloads.28.sqlitedb");
        let conn = Connection::open(&template).unwrap();
        conn.execute_batch(DOWNLOAD_LIST_SCHEMA).unwrap();
        for (local, url) in [
            ("/var/x/BLDatabaseManager/BLDatabaseManager.sqlite", "https://cdn/BLDatabaseManager.sqlite"),
            ("/var/x/BLDatabaseManager/BLDatabaseManager.sqlite-shm", "https://cdn/BLDatabaseManager.sqlite-shm"),
            ("/var/x/BLDatabaseManager/BLDatabaseManager.sqlite-wal", "https://cdn/BLDatabaseManager.sqlite-wal"),
            ("/var/x/BLDatabaseManager.sqlite.bak", "https://cdn/BLDatabaseManager.sqlite.bak"),
            ("/var/x/NotBLDatabaseManager.sqlite", "https://cdn/NotBLDatabaseManager.sqlite"),
            ("/var/x/BLDatabaseManager.sqlite-journal", "https://cdn/book.epub"),
        ] {
            conn.execute("INSERT INTO asset VALUES (?1, ?2)", params![local, url])
                .unwrap();
        }
        drop(conn);

        let crafter = ManifestCrafter::new(ManifestLayout::new(dir.path()));
        let container = ContainerId::parse(ID).unwrap();
        let crafted = crafter
            .craft(&Redirect {
                target_path: "/var/mobile/t.m4a",
                asset_name: "t.m4a",
                container: &container,
                binding: binding(),
            })
            .unwrap();

        let device = format!(
            "/private/var/containers/Shared/SystemGroup/{ID}/Documents/BLDatabaseManager/BLDatabaseManager.sqlite"
        );
        let served = "http://192.168.1.20:8123/working_BL.sqlite";
        let got = rows(&crafted.download_list, "SELECT local_path, url FROM asset ORDER BY rowid");
        assert_eq!(got[0], [device.clone(), served.to_string()]);
        assert_eq!(got[1], [format!("{device}-shm"), format!("{served}-shm")]);
        assert_eq!(got[2], [format!("{device}-wal"), format!("{served}-wal")]);
        assert_eq!(got[3][0], "/var/x/BLDatabaseManager.sqlite.bak");
        assert_eq!(got[4][0], "/var/x/NotBLDatabaseManager.sqlite");
        assert_eq!(got[4][1], "https://cdn/NotBLDatabaseManager.sqlite");
        assert_eq!(got[5], ["/var/x/BLDatabaseManager.sqlite-journal", "https://cdn/book.epub"]);
    }

    #[test]
    fn scratch_files_cover_all_task_outputs() {
        let layout = ManifestLayout::new("/w");
        assert_eq!(
            layout.scratch_files(),
            [
                PathBuf::from("/w/working_BL.sqlite"),
                PathBuf::from("/w/working_DL.sqlitedb"),
                PathBuf::from("/w/working_DL.sqlitedb-shm"),
                PathBuf::from("/w/working_DL.sqlitedb-wal"),
            ]
        );
        assert_eq!(
            layout.servable_names(),
            ["working_BL.sqlite", "working_BL.sqlite-shm", "working_BL.sqlite-wal"]
        );
    }
}
