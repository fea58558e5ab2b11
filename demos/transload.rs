use simple_transloader::{TransloadConfig, Transloader, UploadConfig};

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    // 第二个目标带 12 字节随机尾缀，上传内容的 MD5 会和源不同
    let mut suffixed = UploadConfig::new("https://httpbin.org/post");
    suffixed.file_name = Some("renamed.zip".into());
    suffixed.random_bytes_count = 12;

    let transloader = Transloader::new(
        "http://ipv4.download.thinkbroadband.com/5MB.zip", // 下载链接
        vec![
            UploadConfig::new("https://httpbin.org/post"), // 上传目标一
            suffixed,                                      // 上传目标二
        ],
        TransloadConfig {
            calculate_md5: true,
            ..Default::default()
        },
    );

    // 启动转存！
    match transloader.transload().await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("结果序列化失败: {e}"),
        },
        Err(e) => eprintln!("转存失败: {e}"),
    }
}
